//! Integration tests for controller packet handling on the host.
//!
//! Uses MockLauncher to simulate worker processes.

use std::sync::Arc;
use std::time::Duration;

use subfleet_host_agent::{
    HostAgent, MockLauncher, RestartPolicy, SupervisorContext, WorkerState,
};
use subfleet_proto::{ArchiveInfo, Packet, ResponseCode, StatusUpdate, Version, WorkerSpec};
use rstest::rstest;
use tempfile::TempDir;
use tokio::sync::mpsc;

struct Harness {
    agent: Arc<HostAgent>,
    launcher: Arc<MockLauncher>,
    outbound: mpsc::UnboundedReceiver<Packet>,
    root: TempDir,
    next_request: u64,
}

fn harness() -> Harness {
    harness_with_cooldown(Duration::from_millis(50))
}

fn harness_with_cooldown(cooldown: Duration) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let launcher = Arc::new(MockLauncher::new());
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound) = mpsc::unbounded_channel();

    let ctx = SupervisorContext {
        launcher: launcher.clone(),
        root: root.path().to_path_buf(),
        agent_version: Version::new("1.0"),
        policy: RestartPolicy { cooldown },
        events: events_tx,
    };
    let agent = HostAgent::new(ctx, outbound_tx);
    agent.spawn_event_pump(events_rx);

    Harness {
        agent,
        launcher,
        outbound,
        root,
        next_request: 1,
    }
}

fn test_spec(name: &str) -> WorkerSpec {
    WorkerSpec::new(name, "./start.sh", "stop")
}

impl Harness {
    fn request_id(&mut self) -> u64 {
        self.next_request += 1;
        self.next_request
    }

    /// Wait for the response to `request_id`, skipping status packets.
    async fn response(&mut self, request_id: u64) -> (ResponseCode, Option<String>, bool) {
        let deadline = Duration::from_secs(5);
        loop {
            let packet = tokio::time::timeout(deadline, self.outbound.recv())
                .await
                .expect("timed out waiting for response")
                .expect("outbound closed");
            if let Packet::Response {
                request_id: id,
                code,
                message,
                running,
            } = packet
            {
                if id == request_id {
                    return (code, message, running);
                }
            }
        }
    }

    async fn add(&mut self, spec: WorkerSpec) -> (ResponseCode, bool) {
        let request_id = self.request_id();
        self.agent
            .handle(Packet::AddWorker {
                request_id: Some(request_id),
                spec,
                log_address: None,
            })
            .await;
        let (code, _, running) = self.response(request_id).await;
        (code, running)
    }

    async fn start(&mut self, name: &str) -> (ResponseCode, Option<String>) {
        let request_id = self.request_id();
        self.agent
            .handle(Packet::StartWorker {
                request_id,
                name: name.to_string(),
                log_address: None,
            })
            .await;
        let (code, message, _) = self.response(request_id).await;
        (code, message)
    }

    async fn stop(&mut self, name: &str, force: bool) -> ResponseCode {
        let request_id = self.request_id();
        self.agent
            .handle(Packet::StopWorker {
                request_id,
                name: name.to_string(),
                force,
            })
            .await;
        self.response(request_id).await.0
    }

    /// Next status packet, skipping responses.
    async fn next_status(&mut self) -> (String, StatusUpdate) {
        loop {
            let packet = tokio::time::timeout(Duration::from_secs(5), self.outbound.recv())
                .await
                .expect("timed out waiting for status")
                .expect("outbound closed");
            if let Packet::Status { name, update } = packet {
                return (name, update);
            }
        }
    }

    /// Start an auto-restart worker and let its process crash.
    async fn crash_auto_restart(&mut self, name: &str) {
        let mut spec = test_spec(name);
        spec.auto_restart = true;
        self.add(spec).await;
        assert_eq!(self.start(name).await.0, ResponseCode::Success);
        self.launcher.last().unwrap().exit(1).await;
        loop {
            if let (_, StatusUpdate::Stopped { allow_restart, .. }) = self.next_status().await {
                assert!(allow_restart);
                return;
            }
        }
    }

    async fn remove(&mut self, name: &str) -> ResponseCode {
        let request_id = self.request_id();
        self.agent
            .handle(Packet::RemoveWorker {
                request_id,
                name: name.to_string(),
            })
            .await;
        self.response(request_id).await.0
    }
}

#[tokio::test]
async fn test_add_is_idempotent_and_reports_running() {
    let mut h = harness();

    assert_eq!(h.add(test_spec("lobby")).await, (ResponseCode::Success, false));
    assert_eq!(h.start("lobby").await.0, ResponseCode::Success);

    let mut edited = test_spec("lobby");
    edited.logging = true;
    assert_eq!(h.add(edited).await, (ResponseCode::Success, true));

    assert_eq!(h.agent.worker_names().await, vec!["lobby"]);
    assert!(h.agent.worker("LOBBY").await.unwrap().spec().await.logging);
    assert!(h.root.path().join("lobby").is_dir());
}

#[rstest]
#[case::unknown_worker("missing", ResponseCode::NoSuchServer, 1)]
#[case::disabled_worker("disabled", ResponseCode::WorkerDisabled, 1)]
#[case::stopped_worker("lobby", ResponseCode::Success, 2)]
#[case::running_worker("running", ResponseCode::AlreadyRunning, 1)]
#[case::agent_too_old("modern", ResponseCode::UnsupportedVersion, 1)]
#[tokio::test]
async fn test_start_response_codes(
    #[case] name: &str,
    #[case] expected: ResponseCode,
    #[case] launches: usize,
) {
    let mut h = harness();
    let mut disabled = test_spec("disabled");
    disabled.enabled = false;
    let mut modern = test_spec("modern");
    modern.min_agent_version = Some(Version::new("2.0"));
    for spec in [test_spec("lobby"), test_spec("running"), disabled, modern] {
        h.add(spec).await;
    }
    assert_eq!(h.start("running").await.0, ResponseCode::Success);

    assert_eq!(h.start(name).await.0, expected);
    assert_eq!(h.launcher.launch_count(), launches);
}

#[tokio::test]
async fn test_removed_worker_is_not_restarted_after_cooldown() {
    let mut h = harness_with_cooldown(Duration::from_millis(300));
    h.crash_auto_restart("lobby").await;

    // Removal lands inside the cool-down.
    assert_eq!(h.remove("lobby").await, ResponseCode::Success);
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(h.launcher.launch_count(), 1);
    assert!(h.agent.worker("lobby").await.is_none());
}

#[tokio::test]
async fn test_reset_during_cooldown_does_not_double_start() {
    let mut h = harness_with_cooldown(Duration::from_millis(300));
    h.crash_auto_restart("lobby").await;
    let old = h.agent.worker("lobby").await.unwrap();

    h.agent
        .handle(Packet::Reset {
            reason: "Prevent Desync".to_string(),
        })
        .await;
    let mut spec = test_spec("lobby");
    spec.auto_restart = true;
    assert_eq!(h.add(spec).await, (ResponseCode::Success, false));
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(old.is_retired().await);
    assert_eq!(old.state().await, WorkerState::Stopped);
    assert_eq!(h.launcher.launch_count(), 1);
    let current = h.agent.worker("lobby").await.unwrap();
    assert!(!current.is_retired().await);
    assert_eq!(current.state().await, WorkerState::Stopped);
}

#[tokio::test]
async fn test_incompatible_worker_blocks_start() {
    let mut h = harness();
    let mut survival = test_spec("survival");
    survival.incompatible = vec!["Creative".to_string()];
    h.add(survival).await;
    h.add(test_spec("creative")).await;

    assert_eq!(h.start("creative").await.0, ResponseCode::Success);
    let (code, message) = h.start("survival").await;
    assert_eq!(code, ResponseCode::Incompatible);
    assert_eq!(message.as_deref(), Some("creative"));
}

#[tokio::test]
async fn test_stop_and_command_codes() {
    let mut h = harness();
    h.add(test_spec("lobby")).await;

    assert_eq!(h.stop("missing", false).await, ResponseCode::NoSuchServer);
    assert_eq!(h.stop("lobby", false).await, ResponseCode::NOT_RUNNING);

    h.start("lobby").await;
    let request_id = h.request_id();
    h.agent
        .handle(Packet::CommandWorker {
            request_id,
            name: "lobby".to_string(),
            initiator: None,
            text: "say hello".to_string(),
        })
        .await;
    assert_eq!(h.response(request_id).await.0, ResponseCode::Success);

    assert_eq!(h.stop("lobby", false).await, ResponseCode::Success);
    let worker = h.agent.worker("lobby").await.unwrap();
    worker.wait_for().await;
    assert_eq!(
        h.launcher.last().unwrap().stdin_lines(),
        vec!["say hello", "stop"]
    );
}

#[tokio::test]
async fn test_remove_keeps_running_worker() {
    let mut h = harness();
    h.add(test_spec("lobby")).await;
    h.start("lobby").await;

    assert_eq!(h.remove("lobby").await, ResponseCode::Vetoed);
    assert!(h.agent.worker("lobby").await.is_some());

    assert_eq!(h.stop("lobby", true).await, ResponseCode::Success);
    h.agent.worker("lobby").await.unwrap().wait_for().await;

    assert_eq!(h.remove("lobby").await, ResponseCode::Success);
    assert!(h.agent.worker("lobby").await.is_none());
    assert_eq!(h.remove("lobby").await, ResponseCode::NoSuchServer);
}

#[tokio::test]
async fn test_delete_with_recycle_archives_directory() {
    let mut h = harness();
    let spec = test_spec("minigame");
    h.add(spec.clone()).await;
    std::fs::write(h.root.path().join("minigame/server.properties"), "motd=hi").unwrap();

    let request_id = h.request_id();
    h.agent
        .handle(Packet::DeleteWorker {
            request_id,
            name: "minigame".to_string(),
            archive: ArchiveInfo::snapshot(&spec),
            recycle: true,
        })
        .await;
    assert_eq!(h.response(request_id).await.0, ResponseCode::Success);

    assert!(!h.root.path().join("minigame").exists());
    let recycled: Vec<_> = std::fs::read_dir(h.root.path().join(".recycle"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(recycled.len(), 1);
    assert!(recycled[0].join("files/server.properties").is_file());

    let info = std::fs::read_to_string(recycled[0].join("info.json")).unwrap();
    let archive: ArchiveInfo = serde_json::from_str(&info).unwrap();
    assert_eq!(archive.spec, spec);
}

#[tokio::test]
async fn test_hard_delete_removes_directory() {
    let mut h = harness();
    let spec = test_spec("minigame");
    h.add(spec.clone()).await;

    let request_id = h.request_id();
    h.agent
        .handle(Packet::DeleteWorker {
            request_id,
            name: "minigame".to_string(),
            archive: ArchiveInfo::snapshot(&spec),
            recycle: false,
        })
        .await;
    assert_eq!(h.response(request_id).await.0, ResponseCode::Success);
    assert!(!h.root.path().join("minigame").exists());
    assert!(!h.root.path().join(".recycle").exists());
}

#[tokio::test]
async fn test_reset_forgets_all_workers() {
    let mut h = harness();
    h.add(test_spec("a")).await;
    h.add(test_spec("b")).await;
    h.start("a").await;
    let a = h.agent.worker("a").await.unwrap();

    h.agent
        .handle(Packet::Reset {
            reason: "Prevent Desync".to_string(),
        })
        .await;

    assert!(h.agent.worker_names().await.is_empty());
    assert_eq!(a.state().await, WorkerState::Stopped);
    assert!(!a.allow_restart().await);
}

#[tokio::test]
async fn test_temporary_worker_is_deregistered() {
    let mut h = harness();
    let mut spec = test_spec("event");
    spec.temporary = true;
    h.add(spec).await;
    h.start("event").await;

    h.launcher.last().unwrap().exit(0).await;

    loop {
        let packet = tokio::time::timeout(Duration::from_secs(5), h.outbound.recv())
            .await
            .unwrap()
            .unwrap();
        if let Packet::Status { name, update } = packet {
            if update == StatusUpdate::Deregistered {
                assert_eq!(name, "event");
                break;
            }
        }
    }
    assert!(h.agent.worker("event").await.is_none());
}

#[tokio::test]
async fn test_status_packets_follow_lifecycle() {
    let mut h = harness();
    let mut spec = test_spec("lobby");
    spec.logging = true;
    h.add(spec).await;
    h.start("lobby").await;
    h.launcher.last().unwrap().emit("Done!").await.unwrap();

    async fn next_status(h: &mut Harness) -> StatusUpdate {
        loop {
            let packet = tokio::time::timeout(Duration::from_secs(5), h.outbound.recv())
                .await
                .unwrap()
                .unwrap();
            if let Packet::Status { update, .. } = packet {
                return update;
            }
        }
    }

    assert!(matches!(next_status(&mut h).await, StatusUpdate::Started { .. }));
    match next_status(&mut h).await {
        StatusUpdate::Output { line, .. } => assert_eq!(line, "Done!"),
        other => panic!("expected output, got {other:?}"),
    }

    h.stop("lobby", false).await;
    assert_eq!(
        next_status(&mut h).await,
        StatusUpdate::Stopped {
            exit_code: 0,
            allow_restart: false,
        }
    );
}
