//! Worker supervisor - owns a single worker process lifecycle.
//!
//! The supervisor:
//! - Spawns the worker command and plumbs its stdin and output
//! - Delivers stop and console commands over stdin
//! - Watches for exit and applies the auto-restart policy
//! - Records a bounded history of commands sent to the worker
//!
//! ## State Machine
//!
//! ```text
//! stopped -> starting -> running -> stopping -> stopped
//!    ^                      |                      |
//!    |                      +----- crashed --------+
//!    +------ [cool-down] ------ restarting <-------+
//! ```
//!
//! `allow_restart` is set when a process starts and cleared by an explicit
//! stop, terminate or stop command. Only an exit with `allow_restart` still
//! set is eligible for an automatic restart.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use subfleet_proto::{StatusUpdate, Version, WorkerSpec};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::process::{LaunchRequest, Launcher, ProcessExit, ProcessInput, ProcessOutput};

/// Default delay between an unexpected exit and the automatic restart.
pub const RESTART_COOLDOWN: Duration = Duration::from_millis(2500);

/// Poll interval of [`WorkerSupervisor::wait_for`].
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Number of commands kept in the history.
pub const HISTORY_LIMIT: usize = 256;

// =============================================================================
// Types
// =============================================================================

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    /// A stop was requested; the process has not exited yet.
    Stopping,
}

/// Auto-restart policy.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Delay before an automatic restart.
    pub cooldown: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            cooldown: RESTART_COOLDOWN,
        }
    }
}

/// A line sent to a worker's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoggedCommand {
    pub at: DateTime<Utc>,
    /// `None` for the controller console.
    pub initiator: Option<Uuid>,
    pub text: String,
}

/// Status change of a worker, tagged with its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEvent {
    pub name: String,
    pub update: StatusUpdate,
}

/// Result of [`WorkerSupervisor::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    Disabled,
    /// This agent is older than the worker requires.
    Unsupported { required: Version },
    /// The OS could not create the process.
    LaunchFailed(String),
    /// The worker was dropped from the worker set.
    Retired,
}

/// Shared context for all supervisors on a host.
#[derive(Clone)]
pub struct SupervisorContext {
    pub launcher: Arc<dyn Launcher>,
    /// Worker directories are relative to this root.
    pub root: PathBuf,
    pub agent_version: Version,
    pub policy: RestartPolicy,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
}

// =============================================================================
// Supervisor
// =============================================================================

/// Handle to one worker's supervisor. Cheap to clone.
#[derive(Clone)]
pub struct WorkerSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: SupervisorContext,
    data: Mutex<WorkerData>,
}

struct WorkerData {
    spec: WorkerSpec,
    state: WorkerState,
    allow_restart: bool,
    log_address: Option<Uuid>,
    stdin: Option<ProcessInput>,
    kill: Option<oneshot::Sender<()>>,
    pid: Option<u32>,
    /// Incremented per launch so a stale monitor never tears down a newer
    /// process.
    generation: u64,
    /// Set once the worker leaves the worker set. Blocks every later start,
    /// including a restart still waiting out its cool-down.
    retired: bool,
    history: VecDeque<LoggedCommand>,
}

impl WorkerData {
    fn is_running(&self) -> bool {
        matches!(self.state, WorkerState::Running | WorkerState::Stopping)
    }

    fn record(&mut self, initiator: Option<Uuid>, text: &str) {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(LoggedCommand {
            at: Utc::now(),
            initiator,
            text: text.to_string(),
        });
    }
}

impl WorkerSupervisor {
    pub fn new(spec: WorkerSpec, ctx: SupervisorContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                data: Mutex::new(WorkerData {
                    spec,
                    state: WorkerState::Stopped,
                    allow_restart: false,
                    log_address: None,
                    stdin: None,
                    kill: None,
                    pid: None,
                    generation: 0,
                    retired: false,
                    history: VecDeque::new(),
                }),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub async fn name(&self) -> String {
        self.inner.data.lock().await.spec.name.clone()
    }

    pub async fn spec(&self) -> WorkerSpec {
        self.inner.data.lock().await.spec.clone()
    }

    pub async fn state(&self) -> WorkerState {
        self.inner.data.lock().await.state
    }

    pub async fn is_running(&self) -> bool {
        self.inner.data.lock().await.is_running()
    }

    pub async fn allow_restart(&self) -> bool {
        self.inner.data.lock().await.allow_restart
    }

    pub async fn log_address(&self) -> Option<Uuid> {
        self.inner.data.lock().await.log_address
    }

    pub async fn pid(&self) -> Option<u32> {
        self.inner.data.lock().await.pid
    }

    pub async fn is_retired(&self) -> bool {
        self.inner.data.lock().await.retired
    }

    pub async fn history(&self) -> Vec<LoggedCommand> {
        self.inner.data.lock().await.history.iter().cloned().collect()
    }

    /// Replace the editable configuration. The name is kept.
    ///
    /// Takes effect on the next start, except for the logging flag, the
    /// stop command and the restart flags, which apply immediately.
    pub async fn update_spec(&self, spec: WorkerSpec) {
        let mut data = self.inner.data.lock().await;
        let name = data.spec.name.clone();
        data.spec = WorkerSpec { name, ..spec };
    }

    pub async fn set_enabled(&self, enabled: bool) {
        self.inner.data.lock().await.spec.enabled = enabled;
    }

    pub async fn set_logging(&self, logging: bool) {
        self.inner.data.lock().await.spec.logging = logging;
    }

    /// Re-associate the output stream with a new log address.
    pub async fn set_log_address(&self, log_address: Option<Uuid>) {
        self.inner.data.lock().await.log_address = log_address;
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Mark the worker as dropped from the worker set.
    pub async fn retire(&self) {
        self.inner.data.lock().await.retired = true;
    }

    /// Retire the worker unless a process is running. Returns false, and
    /// leaves the worker as it was, when it is running.
    pub async fn retire_if_stopped(&self) -> bool {
        let mut data = self.inner.data.lock().await;
        if data.state != WorkerState::Stopped {
            return false;
        }
        data.retired = true;
        true
    }

    /// Undo [`WorkerSupervisor::retire`] after a removal failed.
    pub async fn reinstate(&self) {
        self.inner.data.lock().await.retired = false;
    }

    /// Launch the worker process.
    ///
    /// A launch failure is reported as a `launch_exception` status, leaves
    /// the worker stopped and never triggers an automatic restart.
    pub async fn start(&self, log_address: Option<Uuid>) -> StartOutcome {
        let mut data = self.inner.data.lock().await;
        let name = data.spec.name.clone();

        if data.retired {
            debug!(worker = %name, "Retired, ignoring start");
            return StartOutcome::Retired;
        }
        if data.state != WorkerState::Stopped {
            debug!(worker = %name, "Already running, ignoring start");
            return StartOutcome::AlreadyRunning;
        }
        if !data.spec.enabled {
            debug!(worker = %name, "Disabled, ignoring start");
            return StartOutcome::Disabled;
        }
        if let Some(required) = &data.spec.min_agent_version {
            if *required > self.inner.ctx.agent_version {
                warn!(
                    worker = %name,
                    required = %required,
                    agent = %self.inner.ctx.agent_version,
                    "Agent too old for worker"
                );
                return StartOutcome::Unsupported {
                    required: required.clone(),
                };
            }
        }

        data.state = WorkerState::Starting;
        if log_address.is_some() {
            data.log_address = log_address;
        }

        let request = LaunchRequest {
            name: name.clone(),
            command: data.spec.executable.clone(),
            directory: self.inner.ctx.root.join(&data.spec.directory),
        };

        let spawned = match self.inner.ctx.launcher.launch(&request).await {
            Ok(spawned) => spawned,
            Err(e) => {
                error!(worker = %name, error = %e, reason = e.reason_code(), "Worker failed to launch");
                data.state = WorkerState::Stopped;
                data.allow_restart = false;
                self.emit(
                    &name,
                    StatusUpdate::LaunchException {
                        message: e.to_string(),
                    },
                );
                return StartOutcome::LaunchFailed(e.to_string());
            }
        };

        let (kill_tx, kill_rx) = oneshot::channel();
        data.generation += 1;
        data.state = WorkerState::Running;
        data.allow_restart = true;
        data.stdin = Some(spawned.stdin);
        data.kill = Some(kill_tx);
        data.pid = spawned.pid;
        let generation = data.generation;
        let log_address = data.log_address;

        for output in spawned.output {
            self.spawn_output_pump(output);
        }
        self.spawn_monitor(spawned.exit, kill_rx, generation);

        info!(worker = %name, pid = ?spawned.pid, "Worker started");
        self.emit(&name, StatusUpdate::Started { log_address });
        StartOutcome::Started
    }

    /// Ask the worker to stop by writing its stop command to stdin.
    ///
    /// Returns once the line is written, not once the process exits.
    /// Returns false if the worker is not running or the write failed.
    pub async fn stop(&self) -> bool {
        let mut data = self.inner.data.lock().await;
        if !data.is_running() {
            return false;
        }
        let line = data.spec.stop_command.clone();
        if !write_line(&mut data, &line).await {
            return false;
        }
        data.allow_restart = false;
        data.state = WorkerState::Stopping;
        data.record(None, &line);
        info!(worker = %data.spec.name, "Stop requested");
        true
    }

    /// Kill the worker process without grace period.
    pub async fn terminate(&self) -> bool {
        let mut data = self.inner.data.lock().await;
        if !data.is_running() {
            return false;
        }
        let Some(kill) = data.kill.take() else {
            // Kill already requested, the process is on its way out.
            return true;
        };
        data.allow_restart = false;
        data.state = WorkerState::Stopping;
        info!(worker = %data.spec.name, "Terminating worker");
        let _ = kill.send(());
        true
    }

    /// Write a console line to the worker's stdin.
    ///
    /// Sending the stop command this way suppresses the automatic restart
    /// like [`WorkerSupervisor::stop`] does.
    pub async fn command(&self, initiator: Option<Uuid>, text: &str) -> bool {
        let mut data = self.inner.data.lock().await;
        if !data.is_running() {
            return false;
        }
        if !write_line(&mut data, text).await {
            return false;
        }
        if text.trim().eq_ignore_ascii_case(data.spec.stop_command.trim()) {
            data.allow_restart = false;
            data.state = WorkerState::Stopping;
        }
        data.record(initiator, text);
        true
    }

    /// Wait until the process has exited and teardown has completed.
    pub async fn wait_for(&self) {
        while self.is_running().await {
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn emit(&self, name: &str, update: StatusUpdate) {
        let event = WorkerEvent {
            name: name.to_string(),
            update,
        };
        if self.inner.ctx.events.send(event).is_err() {
            debug!(worker = %name, "Status receiver dropped");
        }
    }

    fn spawn_output_pump(&self, output: ProcessOutput) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(output).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => supervisor.forward_output(line).await,
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "Worker output closed");
                        break;
                    }
                }
            }
        });
    }

    async fn forward_output(&self, line: String) {
        let (name, logging, log_address) = {
            let data = self.inner.data.lock().await;
            (data.spec.name.clone(), data.spec.logging, data.log_address)
        };
        if !logging {
            return;
        }
        info!(worker = %name, output = %line, "Worker output");
        self.emit(&name, StatusUpdate::Output { log_address, line });
    }

    /// Watch the process until it exits, then apply the restart policy.
    ///
    /// Boxed so the restart path can call back into `start` without making
    /// the future types recursive.
    fn spawn_monitor(
        &self,
        exit: Box<dyn ProcessExit>,
        kill_rx: oneshot::Receiver<()>,
        generation: u64,
    ) {
        let supervisor = self.clone();
        let task: Pin<Box<dyn Future<Output = ()> + Send>> =
            Box::pin(async move { supervisor.monitor(exit, kill_rx, generation).await });
        tokio::spawn(task);
    }

    async fn monitor(
        self,
        mut exit: Box<dyn ProcessExit>,
        mut kill_rx: oneshot::Receiver<()>,
        generation: u64,
    ) {
        let exited = tokio::select! {
            status = exit.wait() => Some(status),
            Ok(()) = &mut kill_rx => None,
        };
        let status = match exited {
            Some(status) => status,
            None => exit.kill().await,
        };

        let (name, allow_restart, temporary, auto_restart) = {
            let mut data = self.inner.data.lock().await;
            if data.generation != generation {
                return;
            }
            data.state = WorkerState::Stopped;
            data.stdin = None;
            data.kill = None;
            data.pid = None;
            (
                data.spec.name.clone(),
                data.allow_restart,
                data.spec.temporary,
                data.spec.auto_restart,
            )
        };

        let exit_code = match status {
            Ok(code) => code,
            Err(e) => {
                error!(worker = %name, error = %e, "Failed to collect exit status");
                -1
            }
        };
        info!(worker = %name, exit_code, allow_restart, "Worker stopped");
        self.emit(
            &name,
            StatusUpdate::Stopped {
                exit_code,
                allow_restart,
            },
        );

        if temporary {
            info!(worker = %name, "Temporary worker exited, deregistering");
            self.emit(&name, StatusUpdate::Deregistered);
            return;
        }

        if auto_restart && allow_restart {
            let cooldown = self.inner.ctx.policy.cooldown;
            info!(worker = %name, delay_ms = cooldown.as_millis() as u64, "Scheduling restart");
            tokio::time::sleep(cooldown).await;
            match self.start(None).await {
                StartOutcome::Started => {}
                outcome => info!(worker = %name, ?outcome, "Automatic restart skipped"),
            }
        }
    }
}

async fn write_line(data: &mut WorkerData, line: &str) -> bool {
    let name = data.spec.name.clone();
    let Some(stdin) = data.stdin.as_mut() else {
        return false;
    };
    let result = async {
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }
    .await;
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(worker = %name, error = %e, "Failed to write to worker stdin");
            false
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
