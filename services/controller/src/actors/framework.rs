//! Core actor framework types and traits.
//!
//! Provides the building blocks the controller's actors are made of:
//! - `Actor` trait for defining actor behavior
//! - `ActorHandle` for sending messages to actors
//! - `Supervisor` for spawning and stopping actors

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Time `Supervisor::stop_all` waits before aborting actor tasks.
const STOP_GRACE: Duration = Duration::from_secs(10);

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// An actor owns its state and processes one message at a time.
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging; also prefixes the actor id.
    fn name(&self) -> &str;

    async fn handle(&mut self, msg: Self::Message);

    /// Called after the last message, when the actor stops.
    async fn on_stop(&mut self) {}
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum ActorError {
    /// The mailbox is closed or the actor dropped a reply.
    #[error("actor stopped")]
    ActorStopped,
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
    actor_id: String,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Send a message, waiting for mailbox space.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ActorError::ActorStopped)
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// True once the actor's mailbox is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// =============================================================================
// Supervisor
// =============================================================================

struct Child {
    task: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Owns the actors it spawned and stops them on request.
#[derive(Default)]
pub struct Supervisor {
    children: HashMap<String, Child>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn and supervise an actor.
    pub fn spawn<A>(&mut self, actor: A, mailbox_size: usize) -> ActorHandle<A::Message>
    where
        A: Actor,
    {
        let actor_id = format!("{}_{}", actor.name(), next_actor_id());
        let (tx, rx) = mpsc::channel(mailbox_size);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_actor_loop(actor, rx, shutdown_rx, actor_id.clone()));
        info!(actor_id = %actor_id, "Spawned actor");

        self.children
            .insert(actor_id.clone(), Child { task, shutdown_tx });
        ActorHandle { tx, actor_id }
    }

    /// Signal one actor to stop and forget it.
    pub fn stop(&mut self, actor_id: &str) -> bool {
        match self.children.remove(actor_id) {
            Some(child) => {
                let _ = child.shutdown_tx.send(true);
                true
            }
            None => false,
        }
    }

    /// Stop every actor, aborting those still running after the grace period.
    pub async fn stop_all(&mut self) {
        info!(count = self.children.len(), "Stopping all actors");
        for child in self.children.values() {
            let _ = child.shutdown_tx.send(true);
        }

        for (actor_id, mut child) in self.children.drain() {
            if tokio::time::timeout(STOP_GRACE, &mut child.task).await.is_err() {
                warn!(actor_id = %actor_id, "Force aborting actor");
                child.task.abort();
            }
        }
    }
}

// =============================================================================
// Actor Loop
// =============================================================================

async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut shutdown: watch::Receiver<bool>,
    actor_id: String,
) {
    debug!(actor_id = %actor_id, "Actor started");
    let mut processed: u64 = 0;

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(actor_id = %actor_id, "Actor received shutdown signal");
                    break;
                }
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!(actor_id = %actor_id, "Actor mailbox closed");
                    break;
                };
                actor.handle(msg).await;
                processed += 1;
            }
        }
    }

    actor.on_stop().await;
    info!(actor_id = %actor_id, messages_processed = processed, "Actor stopped");
}

static ACTOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_actor_id() -> u64 {
    ACTOR_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

// =============================================================================
// Tests
// =============================================================================
