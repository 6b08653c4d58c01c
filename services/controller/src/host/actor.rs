//! Host actor - owns one host's channel and worker view.
//!
//! The actor is the single writer for everything about its host:
//! - The `HostChannel` (connections, link state, pending queue)
//! - The controller's view of the host's workers (`RemoteWorker`)
//! - Handlers waiting on host responses, keyed by request id
//!
//! A bind onto the primary slot resyncs in the same turn, so no other
//! message can interleave between bind and resync.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use subfleet_proto::{
    ArchiveInfo, Packet, RequestId, ResponseCode, StatusUpdate, WorkerSpec,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::channel::{
    BindOutcome, Connection, ConnectionId, HostChannel, LinkState, ResyncEntry,
};
use crate::actors::{Actor, ActorError, ActorHandle};

// =============================================================================
// Messages
// =============================================================================

/// Lifecycle request routed to a worker on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerRequest {
    Start {
        name: String,
        log_address: Option<Uuid>,
    },
    Stop {
        name: String,
        force: bool,
    },
    Command {
        name: String,
        initiator: Option<Uuid>,
        text: String,
    },
}

impl WorkerRequest {
    pub fn name(&self) -> &str {
        match self {
            WorkerRequest::Start { name, .. }
            | WorkerRequest::Stop { name, .. }
            | WorkerRequest::Command { name, .. } => name,
        }
    }

    fn operation(&self) -> &'static str {
        match self {
            WorkerRequest::Start { .. } => "start",
            WorkerRequest::Stop { force: false, .. } => "stop",
            WorkerRequest::Stop { force: true, .. } => "terminate",
            WorkerRequest::Command { .. } => "command",
        }
    }

    fn into_packet(self, request_id: RequestId) -> Packet {
        match self {
            WorkerRequest::Start { name, log_address } => Packet::StartWorker {
                request_id,
                name,
                log_address,
            },
            WorkerRequest::Stop { name, force } => Packet::StopWorker {
                request_id,
                name,
                force,
            },
            WorkerRequest::Command {
                name,
                initiator,
                text,
            } => Packet::CommandWorker {
                request_id,
                name,
                initiator,
                text,
            },
        }
    }
}

/// Messages handled by HostActor.
#[derive(Debug)]
pub enum HostMessage {
    /// Attach an accepted connection to a slot.
    Bind {
        slot: u32,
        connection: Connection,
        reply_to: oneshot::Sender<BindOutcome>,
    },

    /// The connection closed.
    Unbind { connection: ConnectionId },

    /// A packet read from one of the host's connections.
    Incoming { packet: Packet },

    /// Snapshot of the host for the registry.
    View { reply_to: oneshot::Sender<HostView> },

    /// Look up one worker.
    Worker {
        name: String,
        reply_to: oneshot::Sender<Option<RemoteWorker>>,
    },

    SetEnabled { enabled: bool },

    /// Record a worker and ship it to the host.
    Register { spec: WorkerSpec },

    /// Drop a worker locally and ask the host to remove it. Restored if the
    /// host refuses.
    Remove {
        name: String,
        reply_to: oneshot::Sender<ResponseCode>,
    },

    /// Ask the host to delete a worker, archiving it when `recycle` is set.
    /// The local record goes once the host agrees.
    Delete {
        name: String,
        recycle: bool,
        reply_to: oneshot::Sender<ResponseCode>,
    },

    /// Route a lifecycle request. `reply_to` receives the host's answer.
    Request {
        request: WorkerRequest,
        reply_to: Option<oneshot::Sender<ResponseCode>>,
    },
}

// =============================================================================
// State
// =============================================================================

/// The controller's view of a worker on a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteWorker {
    pub host: String,
    pub spec: WorkerSpec,
    pub running: bool,
    /// Live log address while running.
    pub log_address: Option<Uuid>,
}

impl RemoteWorker {
    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

/// Point-in-time snapshot of a host.
#[derive(Debug, Clone)]
pub struct HostView {
    pub name: String,
    pub enabled: bool,
    pub link_state: LinkState,
    pub pending: usize,
    pub slots: Vec<(u32, Option<ConnectionId>)>,
    /// Sorted by name.
    pub workers: Vec<RemoteWorker>,
}

impl HostView {
    /// True when requests reach the host without queueing.
    pub fn is_available(&self) -> bool {
        self.link_state == LinkState::ConnectedClean
    }

    pub fn worker(&self, name: &str) -> Option<&RemoteWorker> {
        self.workers
            .iter()
            .find(|w| w.name().eq_ignore_ascii_case(name))
    }
}

/// What to do when the response to a request arrives.
#[derive(Debug)]
enum PendingResponse {
    /// Add ack; marks the worker running if the host says so.
    Add { name: String },
    Remove {
        worker: RemoteWorker,
        reply_to: oneshot::Sender<ResponseCode>,
    },
    Delete {
        name: String,
        reply_to: oneshot::Sender<ResponseCode>,
    },
    Lifecycle {
        name: String,
        operation: &'static str,
        reply_to: Option<oneshot::Sender<ResponseCode>>,
    },
}

/// Actor owning one host.
pub struct HostActor {
    name: String,
    enabled: bool,
    channel: HostChannel,
    /// Keyed by lowercase name.
    workers: BTreeMap<String, RemoteWorker>,
    pending: HashMap<RequestId, PendingResponse>,
    next_request_id: RequestId,
}

impl HostActor {
    pub fn new(name: impl Into<String>, enabled: bool, max_pending: Option<usize>) -> Self {
        let name = name.into();
        Self {
            channel: HostChannel::new(name.clone(), max_pending),
            name,
            enabled,
            workers: BTreeMap::new(),
            pending: HashMap::new(),
            next_request_id: 1,
        }
    }

    fn request_id(&mut self) -> RequestId {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    fn view(&self) -> HostView {
        HostView {
            name: self.name.clone(),
            enabled: self.enabled,
            link_state: self.channel.link_state(),
            pending: self.channel.pending_len(),
            slots: self.channel.slots(),
            workers: self.workers.values().cloned().collect(),
        }
    }

    fn bind(&mut self, slot: u32, connection: Connection) -> BindOutcome {
        let outcome = self.channel.bind(slot, connection);
        if outcome == (BindOutcome::Bound { resync: true }) {
            let names: Vec<String> = self.workers.keys().cloned().collect();
            let mut snapshot = Vec::with_capacity(names.len());
            for key in names {
                let request_id = self.request_id();
                let Some(worker) = self.workers.get(&key) else {
                    continue;
                };
                snapshot.push(ResyncEntry {
                    spec: worker.spec.clone(),
                    log_address: worker.log_address.filter(|_| worker.running),
                    request_id: Some(request_id),
                });
                self.pending.insert(
                    request_id,
                    PendingResponse::Add {
                        name: worker.spec.name.clone(),
                    },
                );
            }
            self.channel.resync(snapshot);
        }
        outcome
    }

    fn unbind(&mut self, connection: ConnectionId) {
        if self.channel.unbind(connection) != Some(0) {
            return;
        }
        // Requests already handed to the dead connection will never be
        // answered. Queued ones still will be.
        let queued: Vec<RequestId> = self.channel.queued_request_ids().collect();
        let before = self.pending.len();
        self.pending.retain(|id, _| queued.contains(id));
        let lost = before - self.pending.len();
        if lost > 0 {
            warn!(host = %self.name, lost, "Dropped handlers for requests lost with the link");
        }
    }

    fn register(&mut self, spec: WorkerSpec) {
        let key = spec.name.to_lowercase();
        let request_id = self.request_id();
        self.pending.insert(
            request_id,
            PendingResponse::Add {
                name: spec.name.clone(),
            },
        );
        self.channel.enqueue(Packet::AddWorker {
            request_id: Some(request_id),
            spec: spec.clone(),
            log_address: None,
        });

        match self.workers.get_mut(&key) {
            Some(existing) => existing.spec = spec,
            None => {
                info!(host = %self.name, worker = %spec.name, "Worker registered");
                self.workers.insert(
                    key,
                    RemoteWorker {
                        host: self.name.clone(),
                        spec,
                        running: false,
                        log_address: None,
                    },
                );
            }
        }
    }

    fn remove(&mut self, name: String, reply_to: oneshot::Sender<ResponseCode>) {
        let Some(worker) = self.workers.remove(&name.to_lowercase()) else {
            let _ = reply_to.send(ResponseCode::NoSuchServer);
            return;
        };
        let request_id = self.request_id();
        self.channel.enqueue(Packet::RemoveWorker {
            request_id,
            name: worker.spec.name.clone(),
        });
        self.pending
            .insert(request_id, PendingResponse::Remove { worker, reply_to });
    }

    fn delete(&mut self, name: String, recycle: bool, reply_to: oneshot::Sender<ResponseCode>) {
        let Some(worker) = self.workers.get(&name.to_lowercase()) else {
            let _ = reply_to.send(ResponseCode::NoSuchServer);
            return;
        };
        let archive = ArchiveInfo::snapshot(&worker.spec);
        let name = worker.spec.name.clone();
        let request_id = self.request_id();
        self.channel.enqueue(Packet::DeleteWorker {
            request_id,
            name: name.clone(),
            archive,
            recycle,
        });
        self.pending
            .insert(request_id, PendingResponse::Delete { name, reply_to });
    }

    fn request(&mut self, request: WorkerRequest, reply_to: Option<oneshot::Sender<ResponseCode>>) {
        let request_id = self.request_id();
        self.pending.insert(
            request_id,
            PendingResponse::Lifecycle {
                name: request.name().to_string(),
                operation: request.operation(),
                reply_to,
            },
        );
        self.channel.enqueue(request.into_packet(request_id));
    }

    fn incoming(&mut self, packet: Packet) {
        match packet {
            Packet::Response {
                request_id,
                code,
                message,
                running,
            } => self.response(request_id, code, message, running),
            Packet::Status { name, update } => self.status(name, update),
            other => {
                warn!(host = %self.name, kind = other.kind(), "Unexpected packet from host");
            }
        }
    }

    fn response(
        &mut self,
        request_id: RequestId,
        code: ResponseCode,
        message: Option<String>,
        running: bool,
    ) {
        let Some(pending) = self.pending.remove(&request_id) else {
            debug!(host = %self.name, request_id, code = code.code(), "Response to unknown request");
            return;
        };

        match pending {
            PendingResponse::Add { name } => {
                if !code.is_success() {
                    warn!(host = %self.name, worker = %name, code = code.code(), message = ?message, "Host rejected worker");
                    return;
                }
                // The ack carries the host's running flag. Status packets
                // sent while the link was down are lost, so it wins.
                if let Some(worker) = self.workers.get_mut(&name.to_lowercase()) {
                    if worker.running != running {
                        debug!(host = %self.name, worker = %name, running, "Running flag synced from add ack");
                    }
                    worker.running = running;
                    if !running {
                        worker.log_address = None;
                    }
                }
            }
            PendingResponse::Remove { worker, reply_to } => {
                if code.is_success() {
                    info!(host = %self.name, worker = %worker.spec.name, "Worker removed");
                } else {
                    warn!(
                        host = %self.name,
                        worker = %worker.spec.name,
                        code = code.code(),
                        reason = code.describe(),
                        "Host refused removal, re-registering worker"
                    );
                    self.workers.insert(worker.spec.name.to_lowercase(), worker);
                }
                let _ = reply_to.send(code);
            }
            PendingResponse::Delete { name, reply_to } => {
                if code.is_success() {
                    self.workers.remove(&name.to_lowercase());
                    info!(host = %self.name, worker = %name, "Worker deleted");
                } else {
                    warn!(host = %self.name, worker = %name, code = code.code(), message = ?message, "Host refused delete");
                }
                let _ = reply_to.send(code);
            }
            PendingResponse::Lifecycle {
                name,
                operation,
                reply_to,
            } => {
                if code.is_unknown() {
                    warn!(
                        host = %self.name,
                        worker = %name,
                        operation,
                        code = code.code(),
                        "Host answered with an unknown response code, treating as success"
                    );
                } else if code.is_success() {
                    debug!(host = %self.name, worker = %name, operation, code = code.code(), "Request succeeded");
                } else {
                    info!(
                        host = %self.name,
                        worker = %name,
                        operation,
                        code = code.code(),
                        reason = code.describe(),
                        message = ?message,
                        "Request refused by host"
                    );
                }
                if let Some(reply_to) = reply_to {
                    let _ = reply_to.send(code);
                }
            }
        }
    }

    fn status(&mut self, name: String, update: StatusUpdate) {
        let key = name.to_lowercase();
        if update == StatusUpdate::Deregistered {
            if self.workers.remove(&key).is_some() {
                info!(host = %self.name, worker = %name, "Temporary worker deregistered");
            }
            return;
        }

        let Some(worker) = self.workers.get_mut(&key) else {
            debug!(host = %self.name, worker = %name, "Status for unknown worker");
            return;
        };

        match update {
            StatusUpdate::Started { log_address } => {
                worker.running = true;
                worker.log_address = log_address.or(worker.log_address);
                info!(host = %self.name, worker = %name, "Worker started");
            }
            StatusUpdate::LaunchException { message } => {
                worker.running = false;
                warn!(host = %self.name, worker = %name, error = %message, "Worker failed to launch");
            }
            StatusUpdate::Stopped {
                exit_code,
                allow_restart,
            } => {
                worker.running = false;
                worker.log_address = None;
                info!(host = %self.name, worker = %name, exit_code, allow_restart, "Worker stopped");
            }
            StatusUpdate::Output { line, .. } => {
                info!(host = %self.name, worker = %name, line = %line, "Worker output");
            }
            StatusUpdate::Deregistered => {}
        }
    }
}

#[async_trait]
impl Actor for HostActor {
    type Message = HostMessage;

    fn name(&self) -> &str {
        "host"
    }

    async fn handle(&mut self, msg: HostMessage) {
        match msg {
            HostMessage::Bind {
                slot,
                connection,
                reply_to,
            } => {
                let outcome = self.bind(slot, connection);
                let _ = reply_to.send(outcome);
            }
            HostMessage::Unbind { connection } => self.unbind(connection),
            HostMessage::Incoming { packet } => self.incoming(packet),
            HostMessage::View { reply_to } => {
                let _ = reply_to.send(self.view());
            }
            HostMessage::Worker { name, reply_to } => {
                let _ = reply_to.send(self.workers.get(&name.to_lowercase()).cloned());
            }
            HostMessage::SetEnabled { enabled } => {
                info!(host = %self.name, enabled, "Host enabled flag changed");
                self.enabled = enabled;
            }
            HostMessage::Register { spec } => self.register(spec),
            HostMessage::Remove { name, reply_to } => self.remove(name, reply_to),
            HostMessage::Delete {
                name,
                recycle,
                reply_to,
            } => self.delete(name, recycle, reply_to),
            HostMessage::Request { request, reply_to } => self.request(request, reply_to),
        }
    }

    async fn on_stop(&mut self) {
        info!(
            host = %self.name,
            workers = self.workers.len(),
            pending = self.channel.pending_len(),
            "Host actor stopped"
        );
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Typed front for a host actor's mailbox.
#[derive(Clone)]
pub struct HostHandle {
    name: String,
    handle: ActorHandle<HostMessage>,
}

impl HostHandle {
    pub fn new(name: impl Into<String>, handle: ActorHandle<HostMessage>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn actor_id(&self) -> &str {
        self.handle.actor_id()
    }

    async fn ask<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> HostMessage,
    ) -> Result<oneshot::Receiver<T>, ActorError> {
        let (tx, rx) = oneshot::channel();
        self.handle.send(build(tx)).await?;
        Ok(rx)
    }

    pub async fn bind(&self, slot: u32, connection: Connection) -> Result<BindOutcome, ActorError> {
        let rx = self
            .ask(|reply_to| HostMessage::Bind {
                slot,
                connection,
                reply_to,
            })
            .await?;
        rx.await.map_err(|_| ActorError::ActorStopped)
    }

    pub async fn unbind(&self, connection: ConnectionId) -> Result<(), ActorError> {
        self.handle.send(HostMessage::Unbind { connection }).await
    }

    pub async fn deliver(&self, packet: Packet) -> Result<(), ActorError> {
        self.handle.send(HostMessage::Incoming { packet }).await
    }

    pub async fn view(&self) -> Result<HostView, ActorError> {
        let rx = self.ask(|reply_to| HostMessage::View { reply_to }).await?;
        rx.await.map_err(|_| ActorError::ActorStopped)
    }

    pub async fn worker(&self, name: &str) -> Result<Option<RemoteWorker>, ActorError> {
        let name = name.to_string();
        let rx = self
            .ask(|reply_to| HostMessage::Worker { name, reply_to })
            .await?;
        rx.await.map_err(|_| ActorError::ActorStopped)
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<(), ActorError> {
        self.handle.send(HostMessage::SetEnabled { enabled }).await
    }

    pub async fn register(&self, spec: WorkerSpec) -> Result<(), ActorError> {
        self.handle.send(HostMessage::Register { spec }).await
    }

    /// Returns a receiver for the host's answer.
    pub async fn remove(&self, name: &str) -> Result<oneshot::Receiver<ResponseCode>, ActorError> {
        let name = name.to_string();
        self.ask(|reply_to| HostMessage::Remove { name, reply_to })
            .await
    }

    /// Returns a receiver for the host's answer.
    pub async fn delete(
        &self,
        name: &str,
        recycle: bool,
    ) -> Result<oneshot::Receiver<ResponseCode>, ActorError> {
        let name = name.to_string();
        self.ask(|reply_to| HostMessage::Delete {
            name,
            recycle,
            reply_to,
        })
        .await
    }

    /// Returns a receiver for the host's answer.
    pub async fn request(
        &self,
        request: WorkerRequest,
    ) -> Result<oneshot::Receiver<ResponseCode>, ActorError> {
        self.ask(|reply_to| HostMessage::Request {
            request,
            reply_to: Some(reply_to),
        })
        .await
    }
}

// =============================================================================
// Tests
// =============================================================================
