//! # subfleet-proto
//!
//! Packet contract between the subfleet controller and its host agents.
//!
//! ## Framing
//!
//! Packets are JSON objects tagged by a `type` field, one per line. The
//! [`codec`] module provides the line reader and writer used by both sides.
//!
//! ## Packet Flow
//!
//! ```text
//! host agent                      controller
//!     | ---- link --------------->  |
//!     | <--- linked --------------  |
//!     | <--- reset (first resync) - |
//!     | <--- add_worker * N ------  |  snapshot
//!     | <--- queued packets ------  |  drained FIFO
//!     | ---- response / status --> |
//! ```
//!
//! Lifecycle requests carry a `request_id`; the host answers each with a
//! [`Packet::Response`] carrying a [`ResponseCode`].

pub mod codec;
mod error;
mod packet;
mod response;

pub use error::ProtoError;
pub use packet::*;
pub use response::ResponseCode;

/// Re-export so packet consumers agree on the version type.
pub use subfleet_version::Version;
