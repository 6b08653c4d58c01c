//! Intents and the listeners that may veto them.
//!
//! Registry operations are two-phase: the operation is described as an
//! [`Intent`], every listener sees it, and the registry commits only when no
//! listener vetoed. Forced operations skip the listeners.

use std::sync::RwLock;

use subfleet_proto::WorkerSpec;
use uuid::Uuid;

/// An operation about to be applied. `initiator` is `None` for the
/// controller console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    AddWorker {
        initiator: Option<Uuid>,
        host: String,
        spec: WorkerSpec,
    },
    RemoveWorker {
        initiator: Option<Uuid>,
        name: String,
    },
    DeleteWorker {
        initiator: Option<Uuid>,
        name: String,
        recycle: bool,
    },
    StartWorker {
        initiator: Option<Uuid>,
        name: String,
    },
    StopWorker {
        initiator: Option<Uuid>,
        name: String,
        force: bool,
    },
    CommandWorker {
        initiator: Option<Uuid>,
        name: String,
        text: String,
    },
}

impl Intent {
    /// Name of the worker the intent targets.
    pub fn worker(&self) -> &str {
        match self {
            Intent::AddWorker { spec, .. } => &spec.name,
            Intent::RemoveWorker { name, .. }
            | Intent::DeleteWorker { name, .. }
            | Intent::StartWorker { name, .. }
            | Intent::StopWorker { name, .. }
            | Intent::CommandWorker { name, .. } => name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Intent::AddWorker { .. } => "add_worker",
            Intent::RemoveWorker { .. } => "remove_worker",
            Intent::DeleteWorker { .. } => "delete_worker",
            Intent::StartWorker { .. } => "start_worker",
            Intent::StopWorker { .. } => "stop_worker",
            Intent::CommandWorker { .. } => "command_worker",
        }
    }
}

/// A listener's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Veto { reason: String },
}

impl Decision {
    pub fn veto(reason: impl Into<String>) -> Self {
        Decision::Veto {
            reason: reason.into(),
        }
    }
}

pub type Listener = Box<dyn Fn(&Intent) -> Decision + Send + Sync>;

/// Registered intent listeners.
#[derive(Default)]
pub struct Listeners {
    inner: RwLock<Vec<Listener>>,
}

impl Listeners {
    pub fn add(&self, listener: impl Fn(&Intent) -> Decision + Send + Sync + 'static) {
        let mut inner = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.push(Box::new(listener));
    }

    /// Every listener sees the intent; the first veto is returned.
    pub fn evaluate(&self, intent: &Intent) -> Decision {
        let inner = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut decision = Decision::Allow;
        for listener in inner.iter() {
            let answer = listener(intent);
            if decision == Decision::Allow {
                decision = answer;
            }
        }
        decision
    }

    pub fn len(&self) -> usize {
        match self.inner.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn start(name: &str) -> Intent {
        Intent::StartWorker {
            initiator: None,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_no_listeners_allows() {
        let listeners = Listeners::default();
        assert!(listeners.is_empty());
        assert_eq!(listeners.evaluate(&start("lobby")), Decision::Allow);
    }

    #[test]
    fn test_first_veto_wins_and_all_listeners_run() {
        let listeners = Listeners::default();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = seen.clone();
        listeners.add(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Decision::veto("maintenance")
        });
        let counter = seen.clone();
        listeners.add(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Decision::veto("second")
        });

        assert_eq!(
            listeners.evaluate(&start("lobby")),
            Decision::veto("maintenance")
        );
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listener_can_filter_by_intent() {
        let listeners = Listeners::default();
        listeners.add(|intent| match intent {
            Intent::StopWorker { force: false, .. } if intent.worker() == "lobby" => {
                Decision::veto("lobby stays up")
            }
            _ => Decision::Allow,
        });

        let stop = Intent::StopWorker {
            initiator: None,
            name: "lobby".to_string(),
            force: false,
        };
        assert_eq!(stop.kind(), "stop_worker");
        assert_eq!(listeners.evaluate(&stop), Decision::veto("lobby stays up"));
        assert_eq!(listeners.evaluate(&start("lobby")), Decision::Allow);
    }
}
