//! subfleet Controller Library
//!
//! The controller owns the fleet's catalog of hosts and workers. Each host
//! is an actor holding its outbound queue; requests for an unlinked host
//! wait there and are replayed after the host's view has been rebuilt.
//!
//! ## Architecture
//!
//! ```text
//! LinkListener            (TCP accept, link handshake)
//! HostRegistry            (hosts, plain servers, intent listeners)
//! └── HostActor(n)        (one per host, single writer)
//!     └── HostChannel     (slots, pending queue, resync)
//! ```
//!
//! ## Modules
//!
//! - `actors`: actor framework
//! - `host`: host actor and its channel
//! - `intent`: vetoable intents
//! - `registry`: host registry and lifecycle requests
//! - `listener`: link listener

pub mod actors;
pub mod config;
pub mod error;
pub mod host;
pub mod intent;
pub mod listener;
pub mod registry;

// Re-export commonly used types
pub use error::{LinkError, RegistryError};
pub use host::{HostChannel, HostHandle, HostView, LinkState, RemoteWorker};
pub use intent::{Decision, Intent};
pub use listener::LinkListener;
pub use registry::{HostDefinition, HostRegistry, PlainServer, RequestTicket};
