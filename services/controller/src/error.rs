//! Error types for the controller.

use subfleet_proto::ProtoError;
use thiserror::Error;

use crate::actors::ActorError;

/// Registry errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Worker names may not contain spaces.
    #[error("invalid_name: {0:?}")]
    InvalidName(String),

    /// Another worker or plain server already uses the name.
    #[error("name_taken: {0}")]
    NameTaken(String),

    #[error("unknown_host: {0}")]
    UnknownHost(String),

    #[error("host_exists: {0}")]
    HostExists(String),

    /// A host cannot be removed while it still has workers.
    #[error("host_in_use: {0}")]
    HostInUse(String),

    #[error("no_such_worker: {0}")]
    NoSuchWorker(String),

    /// The name belongs to a plain server.
    #[error("not_a_worker: {0}")]
    NotAWorker(String),

    /// An intent listener refused the operation.
    #[error("vetoed: {0}")]
    Vetoed(String),

    /// The owning host actor is gone.
    #[error("host actor unavailable: {0}")]
    Actor(#[from] ActorError),
}

impl RegistryError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RegistryError::InvalidName(_) => "invalid_name",
            RegistryError::NameTaken(_) => "name_taken",
            RegistryError::UnknownHost(_) => "unknown_host",
            RegistryError::HostExists(_) => "host_exists",
            RegistryError::HostInUse(_) => "host_in_use",
            RegistryError::NoSuchWorker(_) => "no_such_worker",
            RegistryError::NotAWorker(_) => "not_a_worker",
            RegistryError::Vetoed(_) => "vetoed",
            RegistryError::Actor(_) => "actor_unavailable",
        }
    }
}

/// Errors on an inbound host connection.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The first frame was not a link request.
    #[error("handshake_failed: {0}")]
    Handshake(String),

    #[error("handshake_timeout")]
    HandshakeTimeout,

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Actor(#[from] ActorError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_match_display_prefix() {
        let errors = [
            RegistryError::InvalidName("a b".into()),
            RegistryError::NameTaken("lobby".into()),
            RegistryError::UnknownHost("beta".into()),
            RegistryError::HostInUse("alpha".into()),
            RegistryError::NoSuchWorker("lobby".into()),
            RegistryError::NotAWorker("proxy".into()),
            RegistryError::Vetoed("maintenance".into()),
        ];
        for error in errors {
            assert!(error.to_string().starts_with(error.reason_code()));
        }
    }
}
