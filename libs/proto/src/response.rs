//! Response codes for lifecycle requests.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of a lifecycle request, carried on the wire as an integer.
///
/// Codes the receiver does not recognise are kept as [`ResponseCode::Unknown`]
/// and treated as success with a warning, so newer peers can add codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum ResponseCode {
    /// 0
    Success,
    /// 1, older peers answer success with this code.
    LegacySuccess,
    /// 2, a listener vetoed the request or the host kept the worker.
    Vetoed,
    /// 3
    NoSuchServer,
    /// 4, the server exists but is not a supervised worker.
    NotAWorker,
    /// 5, host unavailable for start; worker not running for
    /// stop, terminate and command.
    NotAvailable,
    /// 6
    HostDisabled,
    /// 7
    WorkerDisabled,
    /// 8
    AlreadyRunning,
    /// 9, an incompatible worker on the same host is running.
    Incompatible,
    /// 10, the host agent is older than the worker requires.
    UnsupportedVersion,
    /// Any other code.
    Unknown(i32),
}

impl ResponseCode {
    /// Alias used by stop, terminate and command.
    pub const NOT_RUNNING: ResponseCode = ResponseCode::NotAvailable;

    /// Wire value.
    pub const fn code(self) -> i32 {
        match self {
            ResponseCode::Success => 0,
            ResponseCode::LegacySuccess => 1,
            ResponseCode::Vetoed => 2,
            ResponseCode::NoSuchServer => 3,
            ResponseCode::NotAWorker => 4,
            ResponseCode::NotAvailable => 5,
            ResponseCode::HostDisabled => 6,
            ResponseCode::WorkerDisabled => 7,
            ResponseCode::AlreadyRunning => 8,
            ResponseCode::Incompatible => 9,
            ResponseCode::UnsupportedVersion => 10,
            ResponseCode::Unknown(code) => code,
        }
    }

    /// True for 0 and 1.
    pub fn is_success(self) -> bool {
        matches!(self, ResponseCode::Success | ResponseCode::LegacySuccess)
    }

    /// True for codes callers should not treat as failure, which includes
    /// codes this build does not know.
    pub fn is_ok(self) -> bool {
        self.is_success() || self.is_unknown()
    }

    pub fn is_unknown(self) -> bool {
        matches!(self, ResponseCode::Unknown(_))
    }

    /// Short description for logs.
    pub fn describe(self) -> &'static str {
        match self {
            ResponseCode::Success | ResponseCode::LegacySuccess => "success",
            ResponseCode::Vetoed => "vetoed",
            ResponseCode::NoSuchServer => "no such server",
            ResponseCode::NotAWorker => "not a worker",
            ResponseCode::NotAvailable => "host unavailable or worker not running",
            ResponseCode::HostDisabled => "host disabled",
            ResponseCode::WorkerDisabled => "worker disabled",
            ResponseCode::AlreadyRunning => "already running",
            ResponseCode::Incompatible => "incompatible worker running",
            ResponseCode::UnsupportedVersion => "unsupported agent version",
            ResponseCode::Unknown(_) => "unknown response",
        }
    }
}

impl From<i32> for ResponseCode {
    fn from(code: i32) -> Self {
        match code {
            0 => ResponseCode::Success,
            1 => ResponseCode::LegacySuccess,
            2 => ResponseCode::Vetoed,
            3 => ResponseCode::NoSuchServer,
            4 => ResponseCode::NotAWorker,
            5 => ResponseCode::NotAvailable,
            6 => ResponseCode::HostDisabled,
            7 => ResponseCode::WorkerDisabled,
            8 => ResponseCode::AlreadyRunning,
            9 => ResponseCode::Incompatible,
            10 => ResponseCode::UnsupportedVersion,
            other => ResponseCode::Unknown(other),
        }
    }
}

impl From<ResponseCode> for i32 {
    fn from(code: ResponseCode) -> Self {
        code.code()
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.describe())
    }
}
