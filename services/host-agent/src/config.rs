//! Configuration for the host agent.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::supervisor::RESTART_COOLDOWN;

/// Host agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name this host is registered under at the controller.
    pub host_name: String,

    /// Controller link address (`host:port`).
    pub controller_addr: String,

    /// Channel slot to bind; 0 is the control channel.
    pub channel: u32,

    /// Worker directories are relative to this root.
    pub root_dir: PathBuf,

    /// Delay before an automatic restart.
    pub restart_cooldown: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let host_name =
            std::env::var("SUBFLEET_HOST_NAME").unwrap_or_else(|_| "host-1".to_string());

        let controller_addr = std::env::var("SUBFLEET_CONTROLLER_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:4391".to_string());

        let channel = match std::env::var("SUBFLEET_CHANNEL") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("SUBFLEET_CHANNEL is not a channel index: {raw}"))?,
            Err(_) => 0,
        };

        let root_dir = std::env::var("SUBFLEET_ROOT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/subfleet"));

        let restart_cooldown = match std::env::var("SUBFLEET_RESTART_COOLDOWN_MS") {
            Ok(raw) => Duration::from_millis(raw.parse().with_context(|| {
                format!("SUBFLEET_RESTART_COOLDOWN_MS is not a number: {raw}")
            })?),
            Err(_) => RESTART_COOLDOWN,
        };

        let log_level =
            std::env::var("SUBFLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            host_name,
            controller_addr,
            channel,
            root_dir,
            restart_cooldown,
            log_level,
        })
    }
}
