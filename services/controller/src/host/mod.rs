//! Host-side state of the controller.
//!
//! ## Modules
//!
//! - `channel`: outbound queue and resync for one host's link
//! - `actor`: the actor owning a host's channel and worker view

mod actor;
pub mod channel;

pub use actor::{HostActor, HostHandle, HostMessage, HostView, RemoteWorker, WorkerRequest};
pub use channel::{BindOutcome, Connection, ConnectionId, HostChannel, LinkState, ResyncEntry};
