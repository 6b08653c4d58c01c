//! Process launcher interface and implementations.
//!
//! The launcher abstracts OS process creation:
//! - Spawning a worker command in its directory with piped stdio
//! - Waiting for and force-killing the process
//!
//! A mock implementation is provided for testing.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::SupervisorError;

/// What to launch.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Worker name, for logging.
    pub name: String,

    /// Command line, run through the platform shell.
    pub command: String,

    /// Working directory.
    pub directory: PathBuf,
}

/// Writable stdin of a launched process.
pub type ProcessInput = Box<dyn AsyncWrite + Send + Unpin>;

/// One readable output stream of a launched process.
pub type ProcessOutput = Box<dyn AsyncRead + Send + Unpin>;

/// A launched process.
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    pub stdin: ProcessInput,
    /// stdout and stderr.
    pub output: Vec<ProcessOutput>,
    pub exit: Box<dyn ProcessExit>,
}

/// Exit side of a launched process.
#[async_trait]
pub trait ProcessExit: Send {
    /// Wait for the process to exit and return its exit code.
    async fn wait(&mut self) -> io::Result<i32>;

    /// Kill the process without grace period and return its exit code.
    async fn kill(&mut self) -> io::Result<i32>;
}

/// Process launcher interface.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> Result<SpawnedProcess, SupervisorError>;
}

// =============================================================================
// OS processes
// =============================================================================

/// Launches real OS processes with `tokio::process`.
#[derive(Debug, Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

/// The shell leads a new process group so a kill reaches everything the
/// command line started, not only the shell.
#[cfg(unix)]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line).process_group(0);
    cmd
}

#[cfg(windows)]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(line);
    cmd
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<SpawnedProcess, SupervisorError> {
        if request.command.trim().is_empty() {
            return Err(SupervisorError::EmptyCommand(request.name.clone()));
        }

        info!(
            worker = %request.name,
            command = %request.command,
            cwd = %request.directory.display(),
            "Launching worker process"
        );

        let mut child = shell_command(&request.command)
            .current_dir(&request.directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::LaunchFailed {
                worker: request.name.clone(),
                detail: format!("spawn failed: {e}"),
            })?;

        let missing = |stream: &str| SupervisorError::LaunchFailed {
            worker: request.name.clone(),
            detail: format!("{stream} not captured"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        Ok(SpawnedProcess {
            pid: child.id(),
            stdin: Box::new(stdin),
            output: vec![Box::new(stdout), Box::new(stderr)],
            exit: Box::new(ChildExit { child }),
        })
    }
}

struct ChildExit {
    child: Child,
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[async_trait]
impl ProcessExit for ChildExit {
    async fn wait(&mut self) -> io::Result<i32> {
        self.child.wait().await.map(exit_code)
    }

    async fn kill(&mut self) -> io::Result<i32> {
        if let Some(pid) = self.child.id() {
            if let Err(e) = kill_group(pid) {
                debug!(pid, error = %e, "Process group kill failed, killing the shell only");
            }
        }
        // Reaps the shell; a no-op error if the group kill already took it.
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "Kill after group kill");
        }
        self.wait().await
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: killpg only sends a signal; the group id is the shell's pid,
    // which leads its own group and has not been reaped yet.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) -> io::Result<()> {
    Ok(())
}

// =============================================================================
// Mock
// =============================================================================

/// Exit code reported by a killed mock process.
pub const MOCK_KILL_EXIT_CODE: i32 = 137;

/// Control handle for one process launched by [`MockLauncher`].
#[derive(Clone)]
pub struct MockProcess {
    pub pid: u32,
    stdin_lines: Arc<Mutex<Vec<String>>>,
    exit_tx: Arc<watch::Sender<Option<i32>>>,
    output: Arc<tokio::sync::Mutex<Option<DuplexStream>>>,
}

impl MockProcess {
    /// Lines the supervisor has written to stdin so far.
    pub fn stdin_lines(&self) -> Vec<String> {
        self.stdin_lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }

    /// Exit code, once exited.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_tx.borrow()
    }

    /// Make the process exit with `code`. Later exits are ignored.
    pub async fn exit(&self, code: i32) {
        finish(&self.exit_tx, &self.output, code).await;
    }

    /// Print a line on the process output.
    pub async fn emit(&self, line: &str) -> io::Result<()> {
        let mut output = self.output.lock().await;
        match output.as_mut() {
            Some(stream) => {
                stream.write_all(line.as_bytes()).await?;
                stream.write_all(b"\n").await
            }
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "process exited")),
        }
    }
}

async fn finish(
    exit_tx: &watch::Sender<Option<i32>>,
    output: &tokio::sync::Mutex<Option<DuplexStream>>,
    code: i32,
) {
    exit_tx.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(code);
        true
    });
    // Dropping the writer ends the output stream.
    output.lock().await.take();
}

/// Launcher for testing. Processes exit with code 0 once they read the
/// graceful stop line on stdin, or when told to through [`MockProcess`].
pub struct MockLauncher {
    graceful_line: String,
    fail_launches: AtomicBool,
    next_pid: AtomicU32,
    processes: Mutex<Vec<MockProcess>>,
}

impl MockLauncher {
    /// Create a mock launcher whose processes stop on `stop`.
    pub fn new() -> Self {
        Self::with_graceful_line("stop")
    }

    pub fn with_graceful_line(line: impl Into<String>) -> Self {
        Self {
            graceful_line: line.into(),
            fail_launches: AtomicBool::new(false),
            next_pid: AtomicU32::new(1000),
            processes: Mutex::new(Vec::new()),
        }
    }

    /// Create a mock launcher that fails all launches.
    pub fn failing() -> Self {
        let launcher = Self::new();
        launcher.set_failing(true);
        launcher
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_launches.store(failing, Ordering::SeqCst);
    }

    /// Number of successful launches.
    pub fn launch_count(&self) -> usize {
        self.processes.lock().map(|p| p.len()).unwrap_or_default()
    }

    /// The most recently launched process.
    pub fn last(&self) -> Option<MockProcess> {
        self.processes.lock().ok().and_then(|p| p.last().cloned())
    }
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<SpawnedProcess, SupervisorError> {
        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(SupervisorError::LaunchFailed {
                worker: request.name.clone(),
                detail: "mock launcher configured to fail".to_string(),
            });
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        debug!(worker = %request.name, pid, "[MOCK] launching process");

        let (stdin_writer, stdin_reader) = tokio::io::duplex(64 * 1024);
        let (output_writer, output_reader) = tokio::io::duplex(64 * 1024);
        let (exit_tx, exit_rx) = watch::channel(None);

        let process = MockProcess {
            pid,
            stdin_lines: Arc::new(Mutex::new(Vec::new())),
            exit_tx: Arc::new(exit_tx),
            output: Arc::new(tokio::sync::Mutex::new(Some(output_writer))),
        };

        tokio::spawn({
            let process = process.clone();
            let graceful = self.graceful_line.clone();
            async move {
                let mut lines = BufReader::new(stdin_reader).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let graceful_stop = line.trim().eq_ignore_ascii_case(&graceful);
                    if let Ok(mut seen) = process.stdin_lines.lock() {
                        seen.push(line);
                    }
                    if graceful_stop {
                        process.exit(0).await;
                        break;
                    }
                }
            }
        });

        if let Ok(mut processes) = self.processes.lock() {
            processes.push(process.clone());
        }

        Ok(SpawnedProcess {
            pid: Some(pid),
            stdin: Box::new(stdin_writer),
            output: vec![Box::new(output_reader)],
            exit: Box::new(MockExit {
                rx: exit_rx,
                process,
            }),
        })
    }
}

struct MockExit {
    rx: watch::Receiver<Option<i32>>,
    process: MockProcess,
}

#[async_trait]
impl ProcessExit for MockExit {
    async fn wait(&mut self) -> io::Result<i32> {
        let code = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "exit channel closed"))?;
        Ok(code.unwrap_or_default())
    }

    async fn kill(&mut self) -> io::Result<i32> {
        self.process.exit(MOCK_KILL_EXIT_CODE).await;
        self.wait().await
    }
}
