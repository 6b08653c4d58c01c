//! Packet definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subfleet_version::Version;
use uuid::Uuid;

use crate::ResponseCode;

/// Correlates a request with its [`Packet::Response`].
pub type RequestId = u64;

fn default_true() -> bool {
    true
}

/// Full configuration of a supervised worker, as shipped to its host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Unique within the fleet.
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    pub port: u16,

    /// Forward process output to the controller.
    #[serde(default)]
    pub logging: bool,

    /// Working directory, relative to the host agent's root.
    pub directory: String,

    /// Launch command line.
    pub executable: String,

    /// Line written to stdin to request a graceful stop.
    pub stop_command: String,

    #[serde(default)]
    pub auto_restart: bool,

    /// Deregister on exit instead of restarting.
    #[serde(default)]
    pub temporary: bool,

    /// Workers on the same host that may not run at the same time.
    #[serde(default)]
    pub incompatible: Vec<String>,

    /// Oldest host agent able to launch this worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_agent_version: Option<Version>,
}

impl WorkerSpec {
    /// Minimal spec used by tests and tooling.
    pub fn new(
        name: impl Into<String>,
        executable: impl Into<String>,
        stop_command: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            directory: name.clone(),
            name,
            enabled: true,
            port: 0,
            logging: false,
            executable: executable.into(),
            stop_command: stop_command.into(),
            auto_restart: false,
            temporary: false,
            incompatible: Vec::new(),
            min_agent_version: None,
        }
    }

    /// Case-insensitive incompatibility check.
    pub fn is_incompatible_with(&self, other: &str) -> bool {
        self.incompatible
            .iter()
            .any(|name| name.eq_ignore_ascii_case(other))
    }
}

/// Metadata attached to a delete so the host can archive the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub name: String,
    pub spec: WorkerSpec,
    pub archived_at: DateTime<Utc>,
}

impl ArchiveInfo {
    pub fn snapshot(spec: &WorkerSpec) -> Self {
        Self {
            name: spec.name.clone(),
            spec: spec.clone(),
            archived_at: Utc::now(),
        }
    }
}

/// Result of a link attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Linked,
    UnknownHost,
    /// The requested channel slot is already bound.
    AlreadyLinked,
    UnsupportedVersion,
}

/// Worker status change reported by a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusUpdate {
    Started {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log_address: Option<Uuid>,
    },
    /// The OS could not create the process.
    LaunchException { message: String },
    Stopped { exit_code: i32, allow_restart: bool },
    Output {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log_address: Option<Uuid>,
        line: String,
    },
    /// A temporary worker removed itself after exiting.
    Deregistered,
}

/// Every message exchanged between controller and host agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Packet {
    /// First frame from a host agent on a new connection.
    Link {
        host: String,
        channel: u32,
        agent_version: Version,
    },

    /// Controller's answer to [`Packet::Link`].
    Linked {
        status: LinkStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Host discards every worker it knows.
    Reset { reason: String },

    AddWorker {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        spec: WorkerSpec,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log_address: Option<Uuid>,
    },

    RemoveWorker { request_id: RequestId, name: String },

    DeleteWorker {
        request_id: RequestId,
        name: String,
        archive: ArchiveInfo,
        /// Move to the recycle area instead of deleting outright.
        recycle: bool,
    },

    StartWorker {
        request_id: RequestId,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log_address: Option<Uuid>,
    },

    StopWorker {
        request_id: RequestId,
        name: String,
        /// Kill instead of sending the stop command.
        force: bool,
    },

    CommandWorker {
        request_id: RequestId,
        name: String,
        /// `None` for the controller console.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initiator: Option<Uuid>,
        text: String,
    },

    Response {
        request_id: RequestId,
        code: ResponseCode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// Set on add-worker acks when the worker is already running.
        #[serde(default)]
        running: bool,
    },

    Status { name: String, update: StatusUpdate },
}

impl Packet {
    /// Wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Link { .. } => "link",
            Packet::Linked { .. } => "linked",
            Packet::Reset { .. } => "reset",
            Packet::AddWorker { .. } => "add_worker",
            Packet::RemoveWorker { .. } => "remove_worker",
            Packet::DeleteWorker { .. } => "delete_worker",
            Packet::StartWorker { .. } => "start_worker",
            Packet::StopWorker { .. } => "stop_worker",
            Packet::CommandWorker { .. } => "command_worker",
            Packet::Response { .. } => "response",
            Packet::Status { .. } => "status",
        }
    }

    /// Request id of a request or response, if it carries one.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Packet::AddWorker { request_id, .. } => *request_id,
            Packet::RemoveWorker { request_id, .. }
            | Packet::DeleteWorker { request_id, .. }
            | Packet::StartWorker { request_id, .. }
            | Packet::StopWorker { request_id, .. }
            | Packet::CommandWorker { request_id, .. }
            | Packet::Response { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// Worker the packet is about, if any.
    pub fn worker_name(&self) -> Option<&str> {
        match self {
            Packet::AddWorker { spec, .. } => Some(&spec.name),
            Packet::RemoveWorker { name, .. }
            | Packet::DeleteWorker { name, .. }
            | Packet::StartWorker { name, .. }
            | Packet::StopWorker { name, .. }
            | Packet::CommandWorker { name, .. }
            | Packet::Status { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn response(request_id: RequestId, code: ResponseCode) -> Self {
        Packet::Response {
            request_id,
            code,
            message: None,
            running: false,
        }
    }

    pub fn response_with_message(
        request_id: RequestId,
        code: ResponseCode,
        message: impl Into<String>,
    ) -> Self {
        Packet::Response {
            request_id,
            code,
            message: Some(message.into()),
            running: false,
        }
    }
}
