//! Actor framework for the controller.
//!
//! Each host is owned by one actor, so every mutation of a host's channel
//! and worker view happens on a single task in mailbox order.

mod framework;

pub use framework::{Actor, ActorError, ActorHandle, Message, Supervisor};
