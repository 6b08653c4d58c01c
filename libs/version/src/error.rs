//! Error types for version parsing.

use thiserror::Error;

/// Errors that can occur when parsing a version identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersionError {
    /// The version string is empty.
    #[error("version cannot be empty")]
    Empty,

    /// One level of a version chain is empty (e.g. `1.0//2`).
    #[error("empty segment at position {position} in '{input}'")]
    EmptySegment { input: String, position: usize },

    /// The type name is not one of the known version types.
    #[error("unknown version type: '{0}'")]
    UnknownType(String),

    /// A constructor was given no numeric components.
    #[error("version needs at least one numeric component")]
    NoComponents,
}

impl VersionError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, VersionError::Empty | VersionError::EmptySegment { .. })
    }
}
