//! subfleet Host Agent
//!
//! Runs on each worker host. Links to the controller, receives the worker
//! set and lifecycle requests, and supervises the worker processes.
//!
//! ## Architecture
//!
//! - **Link**: Keeps the controller connection up, reconnecting with backoff
//! - **Agent**: Applies controller packets to the worker set
//! - **Supervisors**: One per worker, own the OS process and restart policy

use std::sync::Arc;

use anyhow::{Context, Result};
use subfleet_host_agent::agent::SHUTDOWN_GRACE;
use subfleet_host_agent::config::Config;
use subfleet_host_agent::{
    agent_version, BackoffPolicy, HostAgent, LinkClient, LinkConfig, ProcessLauncher,
    RestartPolicy, SupervisorContext,
};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        host = %config.host_name,
        controller = %config.controller_addr,
        root = %config.root_dir.display(),
        version = %agent_version(),
        "Starting subfleet host agent"
    );

    tokio::fs::create_dir_all(&config.root_dir)
        .await
        .with_context(|| format!("failed to create root dir {}", config.root_dir.display()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let ctx = SupervisorContext {
        launcher: Arc::new(ProcessLauncher::new()),
        root: config.root_dir.clone(),
        agent_version: agent_version(),
        policy: RestartPolicy {
            cooldown: config.restart_cooldown,
        },
        events: events_tx,
    };
    let agent = HostAgent::new(ctx, outbound_tx);
    let pump_handle = agent.spawn_event_pump(events_rx);

    let link = LinkClient::new(
        LinkConfig {
            controller_addr: config.controller_addr.clone(),
            host: config.host_name.clone(),
            channel: config.channel,
            agent_version: agent_version(),
            backoff: BackoffPolicy::default(),
        },
        Arc::clone(&agent),
        outbound_rx,
    );
    let mut link_handle = tokio::spawn(link.run(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut link_handle => {
            if let Err(e) = result {
                error!(error = %e, "Link task panicked");
            }
        }
    }

    info!("Stopping workers...");
    agent.shutdown(SHUTDOWN_GRACE).await;

    let _ = shutdown_tx.send(true);
    if !link_handle.is_finished() {
        let _ = link_handle.await;
    }
    pump_handle.abort();

    info!("Host agent shutdown complete");
    Ok(())
}
