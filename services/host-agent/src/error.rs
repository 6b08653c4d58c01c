//! Error types for the host agent.

use thiserror::Error;

/// Worker supervision errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The OS could not create the process.
    #[error("launch_failed: {worker}: {detail}")]
    LaunchFailed { worker: String, detail: String },

    /// The launch command line is empty.
    #[error("empty_command: {0}")]
    EmptyCommand(String),

    /// Writing to the worker's stdin failed.
    #[error("stdin_write_failed: {worker}: {source}")]
    StdinWrite {
        worker: String,
        #[source]
        source: std::io::Error,
    },

    /// Archiving or deleting a worker directory failed.
    #[error("archive_failed: {0}")]
    Archive(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SupervisorError::LaunchFailed { .. } => "launch_failed",
            SupervisorError::EmptyCommand(_) => "empty_command",
            SupervisorError::StdinWrite { .. } => "stdin_write_failed",
            SupervisorError::Archive(_) => "archive_failed",
            SupervisorError::Io(_) => "io_error",
        }
    }
}
