//! Error types for packet framing.

use thiserror::Error;

/// Errors that can occur when reading or writing packets.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The line is not a valid packet.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// A single line exceeded the frame limit.
    #[error("frame too large: {size} bytes (limit {limit})")]
    FrameTooLarge { size: usize, limit: usize },

    /// The peer closed the connection.
    #[error("connection closed")]
    Closed,

    /// IO error on the underlying stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ProtoError {
    fn from(err: serde_json::Error) -> Self {
        ProtoError::Malformed(err.to_string())
    }
}

impl ProtoError {
    /// Returns true if the error means the link is gone rather than one
    /// bad frame.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ProtoError::Closed | ProtoError::Io(_))
    }
}
