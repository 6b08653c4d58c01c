//! subfleet Controller
//!
//! Central service of the fleet. Holds the worker registry, accepts host
//! agent links and routes lifecycle requests to hosts, queueing them while
//! a host is offline.

use std::sync::Arc;

use anyhow::{Context, Result};
use subfleet_controller::config::{self, Config};
use subfleet_controller::{HostRegistry, LinkListener};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SUBFLEET_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting subfleet controller");
    info!(
        listen_addr = %config.listen_addr,
        hosts = config.hosts.len(),
        min_agent_version = %config.min_agent_version,
        max_pending = ?config.max_pending,
        "Configuration loaded"
    );

    let registry = Arc::new(HostRegistry::new(config.max_pending));
    for host in &config.hosts {
        registry.add_host(host.clone()).await?;
    }

    if let Some(path) = &config.workers_file {
        let workers = config::load_workers(path)?;
        info!(count = workers.len(), file = %path.display(), "Registering workers");
        for entry in workers {
            let name = entry.spec.name.clone();
            if let Err(e) = registry.add_worker(None, &entry.host, entry.spec).await {
                warn!(worker = %name, host = %entry.host, error = %e, reason = e.reason_code(), "Skipping worker");
            }
        }
    }

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let link_listener = LinkListener::new(Arc::clone(&registry), config.min_agent_version.clone());
    let mut serve_handle = tokio::spawn(link_listener.serve(listener, shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut serve_handle => {
            if let Err(e) = result {
                error!(error = %e, "Link listener panicked");
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if !serve_handle.is_finished() {
        let _ = serve_handle.await;
    }
    registry.shutdown().await;

    info!("Controller shutdown complete");
    Ok(())
}
