//! Host agent - the worker set of one host and its packet handling.
//!
//! The agent owns one [`WorkerSupervisor`] per known worker, applies
//! controller packets to them and forwards their status changes upstream.
//! Worker names are matched case-insensitively.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use subfleet_proto::{ArchiveInfo, Packet, RequestId, ResponseCode, StatusUpdate, WorkerSpec};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SupervisorError;
use crate::supervisor::{StartOutcome, SupervisorContext, WorkerEvent, WorkerSupervisor};

/// Directory under the root that recycled workers are moved to.
pub const RECYCLE_DIR: &str = ".recycle";

/// How long [`HostAgent::shutdown`] waits for graceful stops.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Worker set of one host.
pub struct HostAgent {
    ctx: SupervisorContext,
    workers: RwLock<HashMap<String, WorkerSupervisor>>,
    outbound: mpsc::UnboundedSender<Packet>,
}

fn key(name: &str) -> String {
    name.to_lowercase()
}

impl HostAgent {
    /// Create an agent. Packets for the controller are sent on `outbound`.
    pub fn new(ctx: SupervisorContext, outbound: mpsc::UnboundedSender<Packet>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            workers: RwLock::new(HashMap::new()),
            outbound,
        })
    }

    pub fn root(&self) -> &Path {
        &self.ctx.root
    }

    pub async fn worker(&self, name: &str) -> Option<WorkerSupervisor> {
        self.workers.read().await.get(&key(name)).cloned()
    }

    /// Names of all known workers, sorted.
    pub async fn worker_names(&self) -> Vec<String> {
        let workers: Vec<WorkerSupervisor> = self.workers.read().await.values().cloned().collect();
        let mut names = Vec::with_capacity(workers.len());
        for worker in workers {
            names.push(worker.name().await);
        }
        names.sort();
        names
    }

    /// Forward supervisor events until the sender side is dropped.
    pub fn spawn_event_pump(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                agent.handle_event(event).await;
            }
            debug!("Worker event stream closed");
        })
    }

    /// Apply a supervisor event: forward it and drop deregistered workers.
    pub async fn handle_event(&self, event: WorkerEvent) {
        if event.update == StatusUpdate::Deregistered {
            let removed = self.workers.write().await.remove(&key(&event.name));
            if removed.is_some() {
                info!(worker = %event.name, "Temporary worker removed");
            }
        }
        self.send(Packet::Status {
            name: event.name,
            update: event.update,
        });
    }

    // -------------------------------------------------------------------------
    // Packet Handlers
    // -------------------------------------------------------------------------

    /// Apply one packet from the controller.
    pub async fn handle(&self, packet: Packet) {
        debug!(kind = packet.kind(), worker = ?packet.worker_name(), "Handling packet");
        match packet {
            Packet::Reset { reason } => self.handle_reset(&reason).await,
            Packet::AddWorker {
                request_id,
                spec,
                log_address,
            } => self.handle_add(request_id, spec, log_address).await,
            Packet::RemoveWorker { request_id, name } => {
                self.handle_remove(request_id, &name).await
            }
            Packet::DeleteWorker {
                request_id,
                name,
                archive,
                recycle,
            } => self.handle_delete(request_id, &name, archive, recycle).await,
            Packet::StartWorker {
                request_id,
                name,
                log_address,
            } => self.handle_start(request_id, &name, log_address).await,
            Packet::StopWorker {
                request_id,
                name,
                force,
            } => self.handle_stop(request_id, &name, force).await,
            Packet::CommandWorker {
                request_id,
                name,
                initiator,
                text,
            } => self.handle_command(request_id, &name, initiator, &text).await,
            other => warn!(kind = other.kind(), "Unexpected packet from controller"),
        }
    }

    async fn handle_reset(&self, reason: &str) {
        let workers: Vec<WorkerSupervisor> =
            self.workers.write().await.drain().map(|(_, w)| w).collect();
        info!(reason = %reason, count = workers.len(), "Resetting worker set");

        for worker in &workers {
            worker.retire().await;
            worker.terminate().await;
        }
        for worker in &workers {
            worker.wait_for().await;
        }
    }

    async fn handle_add(
        &self,
        request_id: Option<RequestId>,
        spec: WorkerSpec,
        log_address: Option<Uuid>,
    ) {
        let name = spec.name.clone();
        let existing = self.worker(&name).await;

        let running = match existing {
            Some(worker) => {
                worker.update_spec(spec).await;
                let running = worker.is_running().await;
                if running && log_address.is_some() {
                    worker.set_log_address(log_address).await;
                }
                debug!(worker = %name, running, "Updated existing worker");
                running
            }
            None => {
                let directory = self.ctx.root.join(&spec.directory);
                if let Err(e) = tokio::fs::create_dir_all(&directory).await {
                    warn!(worker = %name, error = %e, "Failed to create worker directory");
                }
                let worker = WorkerSupervisor::new(spec, self.ctx.clone());
                if log_address.is_some() {
                    worker.set_log_address(log_address).await;
                }
                self.workers.write().await.insert(key(&name), worker);
                info!(worker = %name, "Worker added");
                false
            }
        };

        if let Some(request_id) = request_id {
            self.send(Packet::Response {
                request_id,
                code: ResponseCode::Success,
                message: None,
                running,
            });
        }
    }

    async fn handle_remove(&self, request_id: RequestId, name: &str) {
        let code = match self.take_stopped(name).await {
            Ok(_) => {
                info!(worker = %name, "Worker removed");
                ResponseCode::Success
            }
            Err(code) => code,
        };
        self.respond(request_id, code);
    }

    async fn handle_delete(
        &self,
        request_id: RequestId,
        name: &str,
        archive: ArchiveInfo,
        recycle: bool,
    ) {
        let worker = match self.take_stopped(name).await {
            Ok(worker) => worker,
            Err(code) => return self.respond(request_id, code),
        };

        let spec = worker.spec().await;
        let directory = self.ctx.root.join(&spec.directory);
        let result = if recycle {
            recycle_directory(&self.ctx.root, &directory, &archive).await
        } else {
            delete_directory(&directory).await
        };

        match result {
            Ok(()) => {
                info!(worker = %name, recycle, "Worker deleted");
                self.respond(request_id, ResponseCode::Success);
            }
            Err(e) => {
                warn!(worker = %name, error = %e, "Failed to delete worker files");
                worker.reinstate().await;
                self.workers.write().await.insert(key(name), worker);
                self.send(Packet::response_with_message(
                    request_id,
                    ResponseCode::Vetoed,
                    e.to_string(),
                ));
            }
        }
    }

    /// Remove and retire a worker that is not running. Running workers are
    /// kept.
    async fn take_stopped(&self, name: &str) -> Result<WorkerSupervisor, ResponseCode> {
        let mut workers = self.workers.write().await;
        let worker = workers.get(&key(name)).ok_or(ResponseCode::NoSuchServer)?;
        if !worker.retire_if_stopped().await {
            return Err(ResponseCode::Vetoed);
        }
        workers.remove(&key(name)).ok_or(ResponseCode::NoSuchServer)
    }

    async fn handle_start(&self, request_id: RequestId, name: &str, log_address: Option<Uuid>) {
        let Some(worker) = self.worker(name).await else {
            return self.respond(request_id, ResponseCode::NoSuchServer);
        };

        let blockers = self.incompatible_running(&worker).await;
        if !blockers.is_empty() {
            return self.send(Packet::response_with_message(
                request_id,
                ResponseCode::Incompatible,
                blockers.join(", "),
            ));
        }

        let packet = match worker.start(log_address).await {
            StartOutcome::Started => Packet::response(request_id, ResponseCode::Success),
            StartOutcome::AlreadyRunning => Packet::response(request_id, ResponseCode::AlreadyRunning),
            StartOutcome::Disabled => Packet::response(request_id, ResponseCode::WorkerDisabled),
            StartOutcome::Retired => Packet::response(request_id, ResponseCode::NoSuchServer),
            StartOutcome::Unsupported { required } => Packet::response_with_message(
                request_id,
                ResponseCode::UnsupportedVersion,
                format!("requires agent {required}"),
            ),
            // Reported through the launch_exception status.
            StartOutcome::LaunchFailed(message) => {
                Packet::response_with_message(request_id, ResponseCode::Success, message)
            }
        };
        self.send(packet);
    }

    /// Running workers on this host that may not run alongside `worker`.
    async fn incompatible_running(&self, worker: &WorkerSupervisor) -> Vec<String> {
        let spec = worker.spec().await;
        let others: Vec<WorkerSupervisor> = self.workers.read().await.values().cloned().collect();

        let mut blockers = Vec::new();
        for other in others {
            let other_spec = other.spec().await;
            if other_spec.name.eq_ignore_ascii_case(&spec.name) || !other.is_running().await {
                continue;
            }
            if spec.is_incompatible_with(&other_spec.name)
                || other_spec.is_incompatible_with(&spec.name)
            {
                blockers.push(other_spec.name);
            }
        }
        blockers.sort();
        blockers
    }

    async fn handle_stop(&self, request_id: RequestId, name: &str, force: bool) {
        let Some(worker) = self.worker(name).await else {
            return self.respond(request_id, ResponseCode::NoSuchServer);
        };
        let accepted = if force {
            worker.terminate().await
        } else {
            worker.stop().await
        };
        let code = if accepted {
            ResponseCode::Success
        } else {
            ResponseCode::NOT_RUNNING
        };
        self.respond(request_id, code);
    }

    async fn handle_command(
        &self,
        request_id: RequestId,
        name: &str,
        initiator: Option<Uuid>,
        text: &str,
    ) {
        let Some(worker) = self.worker(name).await else {
            return self.respond(request_id, ResponseCode::NoSuchServer);
        };
        let code = if worker.command(initiator, text).await {
            ResponseCode::Success
        } else {
            ResponseCode::NOT_RUNNING
        };
        self.respond(request_id, code);
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Stop every running worker, killing those still alive after `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        let workers: Vec<WorkerSupervisor> = self.workers.read().await.values().cloned().collect();
        for worker in &workers {
            worker.retire().await;
            worker.stop().await;
        }
        for worker in &workers {
            if tokio::time::timeout(grace, worker.wait_for()).await.is_err() {
                warn!(worker = %worker.name().await, "Worker ignored stop, terminating");
                worker.terminate().await;
                worker.wait_for().await;
            }
        }
        info!(count = workers.len(), "All workers stopped");
    }

    fn respond(&self, request_id: RequestId, code: ResponseCode) {
        self.send(Packet::response(request_id, code));
    }

    fn send(&self, packet: Packet) {
        if self.outbound.send(packet).is_err() {
            debug!("Outbound channel closed, dropping packet");
        }
    }
}

async fn delete_directory(directory: &Path) -> Result<(), SupervisorError> {
    match tokio::fs::remove_dir_all(directory).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SupervisorError::Archive(format!(
            "remove {}: {e}",
            directory.display()
        ))),
    }
}

/// Move a worker directory under the recycle area with its archive info.
async fn recycle_directory(
    root: &Path,
    directory: &Path,
    archive: &ArchiveInfo,
) -> Result<(), SupervisorError> {
    let target: PathBuf = root.join(RECYCLE_DIR).join(format!(
        "{}-{}",
        archive.name,
        archive.archived_at.format("%Y%m%d-%H%M%S")
    ));
    tokio::fs::create_dir_all(&target)
        .await
        .map_err(|e| SupervisorError::Archive(format!("create {}: {e}", target.display())))?;

    if tokio::fs::try_exists(directory).await.unwrap_or(false) {
        tokio::fs::rename(directory, target.join("files"))
            .await
            .map_err(|e| SupervisorError::Archive(format!("move {}: {e}", directory.display())))?;
    }

    let info = serde_json::to_vec_pretty(archive)
        .map_err(|e| SupervisorError::Archive(format!("encode archive info: {e}")))?;
    tokio::fs::write(target.join("info.json"), info).await?;
    Ok(())
}
