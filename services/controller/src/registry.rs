//! Host registry - the controller's catalog of hosts, workers and plain
//! servers.
//!
//! Hosts are actors; the registry holds their handles and aggregates worker
//! lookups across them. Lifecycle operations validate locally, run intent
//! listeners, then route the request to the owning host actor, which queues
//! it until the host is linked.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use subfleet_proto::{ResponseCode, WorkerSpec};
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actors::Supervisor;
use crate::error::RegistryError;
use crate::host::{HostActor, HostHandle, HostView, RemoteWorker, WorkerRequest};
use crate::intent::{Decision, Intent, Listeners};

/// Interval between running-flag checks while waiting for a stop.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Mailbox capacity of each host actor.
pub const HOST_MAILBOX_SIZE: usize = 256;

/// A host as configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDefinition {
    pub name: String,
    pub enabled: bool,
}

impl HostDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
        }
    }
}

/// A server the controller knows about but does not supervise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainServer {
    pub name: String,
    pub address: SocketAddr,
}

/// Result of a request that went through local validation.
///
/// `code` is the local verdict. When it is success the request was routed
/// and [`RequestTicket::host_reply`] resolves with the host's answer.
#[derive(Debug)]
pub struct RequestTicket {
    code: ResponseCode,
    message: Option<String>,
    reply: Option<oneshot::Receiver<ResponseCode>>,
}

impl RequestTicket {
    fn rejected(code: ResponseCode) -> Self {
        Self {
            code,
            message: None,
            reply: None,
        }
    }

    fn routed(reply: oneshot::Receiver<ResponseCode>) -> Self {
        Self {
            code: ResponseCode::Success,
            message: None,
            reply: Some(reply),
        }
    }

    pub fn code(&self) -> ResponseCode {
        self.code
    }

    /// Detail for the code, e.g. the blocking workers for an incompatible
    /// start.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Wait for the host's answer. `None` if the request was rejected
    /// locally or its answer was lost with the link.
    pub async fn host_reply(self) -> Option<ResponseCode> {
        self.reply?.await.ok()
    }
}

/// The controller's registry.
pub struct HostRegistry {
    /// Keyed by lowercase name.
    hosts: RwLock<BTreeMap<String, HostHandle>>,
    /// Keyed by lowercase name.
    servers: RwLock<BTreeMap<String, PlainServer>>,
    supervisor: Mutex<Supervisor>,
    listeners: Listeners,
    max_pending: Option<usize>,
}

impl HostRegistry {
    /// `max_pending` bounds each host's pending queue.
    pub fn new(max_pending: Option<usize>) -> Self {
        Self {
            hosts: RwLock::new(BTreeMap::new()),
            servers: RwLock::new(BTreeMap::new()),
            supervisor: Mutex::new(Supervisor::new()),
            listeners: Listeners::default(),
            max_pending,
        }
    }

    pub fn add_listener(&self, listener: impl Fn(&Intent) -> Decision + Send + Sync + 'static) {
        self.listeners.add(listener);
    }

    fn check(&self, intent: &Intent, forced: bool) -> Result<(), RegistryError> {
        if forced {
            return Ok(());
        }
        match self.listeners.evaluate(intent) {
            Decision::Allow => Ok(()),
            Decision::Veto { reason } => {
                info!(kind = intent.kind(), worker = %intent.worker(), reason = %reason, "Intent vetoed");
                Err(RegistryError::Vetoed(reason))
            }
        }
    }

    // =========================================================================
    // Hosts
    // =========================================================================

    /// Register a host and spawn its actor.
    pub async fn add_host(&self, definition: HostDefinition) -> Result<HostHandle, RegistryError> {
        let key = definition.name.to_lowercase();
        let mut hosts = self.hosts.write().await;
        if hosts.contains_key(&key) {
            return Err(RegistryError::HostExists(definition.name));
        }

        let actor = HostActor::new(definition.name.clone(), definition.enabled, self.max_pending);
        let handle = self.supervisor.lock().await.spawn(actor, HOST_MAILBOX_SIZE);
        let host = HostHandle::new(definition.name.clone(), handle);
        hosts.insert(key, host.clone());

        info!(host = %definition.name, enabled = definition.enabled, "Host added");
        Ok(host)
    }

    /// Remove a host. Refused while it still has workers.
    pub async fn remove_host(&self, name: &str) -> Result<(), RegistryError> {
        let key = name.to_lowercase();
        let mut hosts = self.hosts.write().await;
        let host = hosts
            .get(&key)
            .ok_or_else(|| RegistryError::UnknownHost(name.to_string()))?;

        if !host.view().await?.workers.is_empty() {
            return Err(RegistryError::HostInUse(name.to_string()));
        }

        if let Some(host) = hosts.remove(&key) {
            self.supervisor.lock().await.stop(host.actor_id());
            info!(host = %host.name(), "Host removed");
        }
        Ok(())
    }

    pub async fn host(&self, name: &str) -> Option<HostHandle> {
        self.hosts.read().await.get(&name.to_lowercase()).cloned()
    }

    /// Views of every host, sorted by name.
    pub async fn hosts(&self) -> Result<Vec<HostView>, RegistryError> {
        let handles: Vec<HostHandle> = self.hosts.read().await.values().cloned().collect();
        let mut views = Vec::with_capacity(handles.len());
        for handle in handles {
            views.push(handle.view().await?);
        }
        Ok(views)
    }

    pub async fn set_host_enabled(&self, name: &str, enabled: bool) -> Result<(), RegistryError> {
        let host = self
            .host(name)
            .await
            .ok_or_else(|| RegistryError::UnknownHost(name.to_string()))?;
        host.set_enabled(enabled).await?;
        Ok(())
    }

    // =========================================================================
    // Plain servers
    // =========================================================================

    pub async fn add_server(&self, name: &str, address: SocketAddr) -> Result<(), RegistryError> {
        // Held across the worker lookup so names stay unique.
        let hosts = self.hosts.read().await;
        let mut servers = self.servers.write().await;
        let key = name.to_lowercase();
        if servers.contains_key(&key) || Self::lookup(&hosts, name).await?.is_some() {
            return Err(RegistryError::NameTaken(name.to_string()));
        }
        servers.insert(
            key,
            PlainServer {
                name: name.to_string(),
                address,
            },
        );
        info!(server = %name, address = %address, "Plain server added");
        Ok(())
    }

    pub async fn server(&self, name: &str) -> Option<PlainServer> {
        self.servers.read().await.get(&name.to_lowercase()).cloned()
    }

    // =========================================================================
    // Workers
    // =========================================================================

    async fn lookup(
        hosts: &BTreeMap<String, HostHandle>,
        name: &str,
    ) -> Result<Option<(HostHandle, RemoteWorker)>, RegistryError> {
        for host in hosts.values() {
            if let Some(worker) = host.worker(name).await? {
                return Ok(Some((host.clone(), worker)));
            }
        }
        Ok(None)
    }

    /// Find a worker by name (case-insensitive) on any host.
    pub async fn find_worker(&self, name: &str) -> Result<Option<RemoteWorker>, RegistryError> {
        let hosts = self.hosts.read().await;
        Ok(Self::lookup(&hosts, name).await?.map(|(_, worker)| worker))
    }

    /// Every worker on every host, sorted by name.
    pub async fn workers(&self) -> Result<Vec<RemoteWorker>, RegistryError> {
        let mut workers: Vec<RemoteWorker> = self
            .hosts()
            .await?
            .into_iter()
            .flat_map(|view| view.workers)
            .collect();
        workers.sort_by_key(|w| w.spec.name.to_lowercase());
        Ok(workers)
    }

    /// Resolve a name to its worker, distinguishing plain servers.
    async fn resolve(&self, name: &str) -> Result<(HostHandle, RemoteWorker), RegistryError> {
        let found = {
            let hosts = self.hosts.read().await;
            Self::lookup(&hosts, name).await?
        };
        match found {
            Some(found) => Ok(found),
            None if self.server(name).await.is_some() => {
                Err(RegistryError::NotAWorker(name.to_string()))
            }
            None => Err(RegistryError::NoSuchWorker(name.to_string())),
        }
    }

    /// Register a worker on a host and ship it there.
    pub async fn add_worker(
        &self,
        initiator: Option<Uuid>,
        host: &str,
        spec: WorkerSpec,
    ) -> Result<(), RegistryError> {
        if spec.name.is_empty() || spec.name.contains(' ') {
            return Err(RegistryError::InvalidName(spec.name));
        }

        // The write lock serialises adds so two callers cannot claim a name.
        let hosts = self.hosts.write().await;
        if self.servers.read().await.contains_key(&spec.name.to_lowercase())
            || Self::lookup(&hosts, &spec.name).await?.is_some()
        {
            return Err(RegistryError::NameTaken(spec.name));
        }
        let handle = hosts
            .get(&host.to_lowercase())
            .ok_or_else(|| RegistryError::UnknownHost(host.to_string()))?;

        self.check(
            &Intent::AddWorker {
                initiator,
                host: handle.name().to_string(),
                spec: spec.clone(),
            },
            false,
        )?;

        info!(host = %handle.name(), worker = %spec.name, "Adding worker");
        handle.register(spec).await?;
        Ok(())
    }

    /// Remove a worker. A running worker is stopped and waited for first.
    ///
    /// The worker is dropped locally right away and restored if the host
    /// refuses.
    pub async fn remove_worker(
        &self,
        initiator: Option<Uuid>,
        name: &str,
        forced: bool,
    ) -> Result<RequestTicket, RegistryError> {
        let (host, worker) = self.resolve(name).await?;
        self.check(
            &Intent::RemoveWorker {
                initiator,
                name: worker.spec.name.clone(),
            },
            forced,
        )?;

        self.stop_before_removal(&host, &worker).await?;
        info!(host = %host.name(), worker = %worker.spec.name, "Removing worker");
        Ok(RequestTicket::routed(host.remove(&worker.spec.name).await?))
    }

    /// Delete a worker, archiving it on the host when `recycle` is set.
    ///
    /// The local record goes once the host confirms.
    pub async fn delete_worker(
        &self,
        initiator: Option<Uuid>,
        name: &str,
        recycle: bool,
        forced: bool,
    ) -> Result<RequestTicket, RegistryError> {
        let (host, worker) = self.resolve(name).await?;
        self.check(
            &Intent::DeleteWorker {
                initiator,
                name: worker.spec.name.clone(),
                recycle,
            },
            forced,
        )?;

        self.stop_before_removal(&host, &worker).await?;
        info!(host = %host.name(), worker = %worker.spec.name, recycle, "Deleting worker");
        Ok(RequestTicket::routed(
            host.delete(&worker.spec.name, recycle).await?,
        ))
    }

    async fn stop_before_removal(
        &self,
        host: &HostHandle,
        worker: &RemoteWorker,
    ) -> Result<(), RegistryError> {
        if !worker.running {
            return Ok(());
        }
        debug!(host = %host.name(), worker = %worker.spec.name, "Stopping worker before removal");
        let _ = host
            .request(WorkerRequest::Stop {
                name: worker.spec.name.clone(),
                force: false,
            })
            .await?;
        if !self.wait_for_stop(&worker.spec.name).await? {
            warn!(host = %host.name(), worker = %worker.spec.name, "Host went away before the worker stopped");
        }
        Ok(())
    }

    /// Poll until the worker is no longer running.
    ///
    /// Returns false if the host became unavailable first, since its view
    /// of the worker can no longer change until it relinks.
    pub async fn wait_for_stop(&self, name: &str) -> Result<bool, RegistryError> {
        loop {
            let Some(host) = self.find_worker(name).await?.map(|w| w.host) else {
                return Ok(true);
            };
            let Some(handle) = self.host(&host).await else {
                return Ok(true);
            };
            let view = handle.view().await?;
            match view.worker(name) {
                None => return Ok(true),
                Some(worker) if !worker.running => return Ok(true),
                Some(_) if !view.is_available() => return Ok(false),
                Some(_) => {}
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start a worker.
    ///
    /// Codes: 3 unknown, 4 plain server, 5 host unavailable, 6 host
    /// disabled, 7 worker disabled, 8 already running, 9 incompatible with a
    /// running co-located worker, 2 vetoed.
    pub async fn start_worker(
        &self,
        initiator: Option<Uuid>,
        name: &str,
    ) -> Result<RequestTicket, RegistryError> {
        let (host, worker) = match self.resolve(name).await {
            Ok(found) => found,
            Err(e) => return Self::local_code(e),
        };
        let view = host.view().await?;

        if !view.is_available() {
            return Ok(RequestTicket::rejected(ResponseCode::NotAvailable));
        }
        if !view.enabled {
            return Ok(RequestTicket::rejected(ResponseCode::HostDisabled));
        }
        if !worker.spec.enabled {
            return Ok(RequestTicket::rejected(ResponseCode::WorkerDisabled));
        }
        if worker.running {
            return Ok(RequestTicket::rejected(ResponseCode::AlreadyRunning));
        }

        let blocking: Vec<&str> = view
            .workers
            .iter()
            .filter(|other| other.running && other.name() != worker.name())
            .filter(|other| {
                worker.spec.is_incompatible_with(other.name())
                    || other.spec.is_incompatible_with(worker.name())
            })
            .map(RemoteWorker::name)
            .collect();
        if !blocking.is_empty() {
            let mut ticket = RequestTicket::rejected(ResponseCode::Incompatible);
            ticket.message = Some(blocking.join(", "));
            return Ok(ticket);
        }

        let intent = Intent::StartWorker {
            initiator,
            name: worker.spec.name.clone(),
        };
        if self.check(&intent, false).is_err() {
            return Ok(RequestTicket::rejected(ResponseCode::Vetoed));
        }

        let log_address = worker.spec.logging.then(Uuid::new_v4);
        let reply = host
            .request(WorkerRequest::Start {
                name: worker.spec.name.clone(),
                log_address,
            })
            .await?;
        info!(host = %host.name(), worker = %worker.spec.name, "Start requested");
        Ok(RequestTicket::routed(reply))
    }

    /// Ask a worker to stop with its stop command.
    ///
    /// Codes: 3 unknown, 4 plain server, 5 not running, 2 vetoed.
    pub async fn stop_worker(
        &self,
        initiator: Option<Uuid>,
        name: &str,
    ) -> Result<RequestTicket, RegistryError> {
        self.stop(initiator, name, false).await
    }

    /// Kill a worker's process.
    ///
    /// Codes as [`HostRegistry::stop_worker`].
    pub async fn terminate_worker(
        &self,
        initiator: Option<Uuid>,
        name: &str,
    ) -> Result<RequestTicket, RegistryError> {
        self.stop(initiator, name, true).await
    }

    async fn stop(
        &self,
        initiator: Option<Uuid>,
        name: &str,
        force: bool,
    ) -> Result<RequestTicket, RegistryError> {
        let (host, worker) = match self.resolve(name).await {
            Ok(found) => found,
            Err(e) => return Self::local_code(e),
        };
        if !worker.running {
            return Ok(RequestTicket::rejected(ResponseCode::NOT_RUNNING));
        }

        let intent = Intent::StopWorker {
            initiator,
            name: worker.spec.name.clone(),
            force,
        };
        if self.check(&intent, false).is_err() {
            return Ok(RequestTicket::rejected(ResponseCode::Vetoed));
        }

        let reply = host
            .request(WorkerRequest::Stop {
                name: worker.spec.name.clone(),
                force,
            })
            .await?;
        info!(host = %host.name(), worker = %worker.spec.name, force, "Stop requested");
        Ok(RequestTicket::routed(reply))
    }

    /// Send a line to a worker's stdin.
    ///
    /// Codes: 3 unknown, 4 plain server, 5 not running, 2 vetoed.
    pub async fn command_worker(
        &self,
        initiator: Option<Uuid>,
        name: &str,
        text: &str,
    ) -> Result<RequestTicket, RegistryError> {
        let (host, worker) = match self.resolve(name).await {
            Ok(found) => found,
            Err(e) => return Self::local_code(e),
        };
        if !worker.running {
            return Ok(RequestTicket::rejected(ResponseCode::NOT_RUNNING));
        }

        let intent = Intent::CommandWorker {
            initiator,
            name: worker.spec.name.clone(),
            text: text.to_string(),
        };
        if self.check(&intent, false).is_err() {
            return Ok(RequestTicket::rejected(ResponseCode::Vetoed));
        }

        let reply = host
            .request(WorkerRequest::Command {
                name: worker.spec.name.clone(),
                initiator,
                text: text.to_string(),
            })
            .await?;
        debug!(host = %host.name(), worker = %worker.spec.name, "Command routed");
        Ok(RequestTicket::routed(reply))
    }

    /// Map a lookup failure to its response code.
    fn local_code(error: RegistryError) -> Result<RequestTicket, RegistryError> {
        match error {
            RegistryError::NoSuchWorker(_) => Ok(RequestTicket::rejected(ResponseCode::NoSuchServer)),
            RegistryError::NotAWorker(_) => Ok(RequestTicket::rejected(ResponseCode::NotAWorker)),
            other => Err(other),
        }
    }

    /// Stop every host actor.
    pub async fn shutdown(&self) {
        self.hosts.write().await.clear();
        self.supervisor.lock().await.stop_all().await;
    }
}

// =============================================================================
// Tests
// =============================================================================
