//! subfleet Host Agent Library
//!
//! The host agent runs on each machine that hosts game-server workers. It
//! links to the controller, rebuilds its worker set from the controller's
//! resync and supervises one OS process per worker.
//!
//! ## Architecture
//!
//! ```text
//! LinkClient                  (connection to controller, reconnect backoff)
//! └── HostAgent               (worker set, packet handling)
//!     └── WorkerSupervisor(n) (per-worker process lifecycle)
//!         └── Launcher        (OS processes, mock in tests)
//! ```
//!
//! ## Modules
//!
//! - `process`: process launching behind the `Launcher` trait
//! - `supervisor`: per-worker lifecycle state machine and restart policy
//! - `agent`: worker set and controller packet handling
//! - `link`: controller connection with exponential backoff

pub mod agent;
pub mod config;
pub mod error;
pub mod link;
pub mod process;
pub mod supervisor;

// Re-export commonly used types
pub use agent::HostAgent;
pub use error::SupervisorError;
pub use link::{BackoffPolicy, ConnectionState, LinkClient, LinkConfig};
pub use process::{Launcher, MockLauncher, ProcessLauncher};
pub use supervisor::{
    LoggedCommand, RestartPolicy, StartOutcome, SupervisorContext, WorkerEvent, WorkerState,
    WorkerSupervisor,
};

/// Version this agent reports when linking.
pub fn agent_version() -> subfleet_proto::Version {
    subfleet_proto::Version::new(env!("CARGO_PKG_VERSION"))
}
