//! Integration tests for the controller link.
//!
//! A bare TCP listener plays the controller.

use std::sync::Arc;
use std::time::Duration;

use subfleet_host_agent::{
    BackoffPolicy, ConnectionState, HostAgent, LinkClient, LinkConfig, MockLauncher,
    RestartPolicy, SupervisorContext,
};
use subfleet_proto::codec::{PacketReader, PacketWriter};
use subfleet_proto::{LinkStatus, Packet, ResponseCode, Version, WorkerSpec};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

const TIMEOUT: Duration = Duration::from_secs(5);

fn test_backoff() -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_millis(10),
        max: Duration::from_millis(50),
        jitter: 0.0,
    }
}

async fn spawn_link(
    addr: String,
) -> (
    watch::Sender<bool>,
    watch::Receiver<ConnectionState>,
    tempfile::TempDir,
) {
    let root = tempfile::tempdir().unwrap();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let ctx = SupervisorContext {
        launcher: Arc::new(MockLauncher::new()),
        root: root.path().to_path_buf(),
        agent_version: Version::new("1.0"),
        policy: RestartPolicy::default(),
        events: events_tx,
    };
    let agent = HostAgent::new(ctx, outbound_tx);
    agent.spawn_event_pump(events_rx);

    let link = LinkClient::new(
        LinkConfig {
            controller_addr: addr,
            host: "alpha".to_string(),
            channel: 0,
            agent_version: Version::new("1.0"),
            backoff: test_backoff(),
        },
        agent,
        outbound_rx,
    );
    let state = link.subscribe();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(link.run(shutdown_rx));
    (shutdown_tx, state, root)
}

#[tokio::test]
async fn test_link_handshake_and_request() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (shutdown, mut state, _root) = spawn_link(addr).await;

    let (stream, _) = tokio::time::timeout(TIMEOUT, listener.accept())
        .await
        .unwrap()
        .unwrap();
    let (read_half, write_half) = stream.into_split();
    let mut reader = PacketReader::new(read_half);
    let mut writer = PacketWriter::new(write_half);

    match reader.next().await.unwrap().unwrap() {
        Packet::Link { host, channel, .. } => {
            assert_eq!(host, "alpha");
            assert_eq!(channel, 0);
        }
        other => panic!("expected link, got {other:?}"),
    }
    writer
        .send(&Packet::Linked {
            status: LinkStatus::Linked,
            message: None,
        })
        .await
        .unwrap();

    tokio::time::timeout(TIMEOUT, state.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();

    writer
        .send(&Packet::AddWorker {
            request_id: Some(7),
            spec: WorkerSpec::new("lobby", "./start.sh", "stop"),
            log_address: None,
        })
        .await
        .unwrap();

    let response = tokio::time::timeout(TIMEOUT, reader.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(response, Packet::response(7, ResponseCode::Success));

    shutdown.send(true).unwrap();
    tokio::time::timeout(
        TIMEOUT,
        state.wait_for(|s| *s == ConnectionState::Disconnected),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn test_link_reconnects_after_refusal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (shutdown, mut state, _root) = spawn_link(addr).await;

    // First attempt is refused.
    let (stream, _) = listener.accept().await.unwrap();
    let (read_half, write_half) = stream.into_split();
    let mut reader = PacketReader::new(read_half);
    let mut writer = PacketWriter::new(write_half);
    reader.next().await.unwrap().unwrap();
    writer
        .send(&Packet::Linked {
            status: LinkStatus::AlreadyLinked,
            message: None,
        })
        .await
        .unwrap();
    drop(writer);
    drop(reader);

    // The client backs off and comes back.
    let (stream, _) = tokio::time::timeout(TIMEOUT, listener.accept())
        .await
        .unwrap()
        .unwrap();
    let (read_half, write_half) = stream.into_split();
    let mut reader = PacketReader::new(read_half);
    let mut writer = PacketWriter::new(write_half);
    assert_eq!(reader.next().await.unwrap().unwrap().kind(), "link");
    writer
        .send(&Packet::Linked {
            status: LinkStatus::Linked,
            message: None,
        })
        .await
        .unwrap();

    tokio::time::timeout(TIMEOUT, state.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();
    shutdown.send(true).unwrap();
}
