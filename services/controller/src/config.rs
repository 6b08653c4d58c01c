//! Configuration for the controller.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use subfleet_proto::{Version, WorkerSpec};

use crate::registry::HostDefinition;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address host agents link to.
    pub listen_addr: SocketAddr,

    /// Hosts known at startup.
    pub hosts: Vec<HostDefinition>,

    /// Oldest host agent allowed to link.
    pub min_agent_version: Version,

    /// Bound on each host's pending queue. `None` is unbounded.
    pub max_pending: Option<usize>,

    /// JSON list of workers registered at startup.
    pub workers_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("SUBFLEET_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:4391".to_string())
            .parse()
            .context("SUBFLEET_LISTEN_ADDR is not a socket address")?;

        let hosts = match std::env::var("SUBFLEET_HOSTS") {
            Ok(raw) => parse_hosts(&raw)?,
            Err(_) => Vec::new(),
        };

        let min_agent_version = match std::env::var("SUBFLEET_MIN_AGENT_VERSION") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("SUBFLEET_MIN_AGENT_VERSION is not a version: {raw}"))?,
            Err(_) => Version::new("1.0"),
        };

        let max_pending = match std::env::var("SUBFLEET_MAX_PENDING") {
            Ok(raw) => Some(
                raw.parse()
                    .with_context(|| format!("SUBFLEET_MAX_PENDING is not a number: {raw}"))?,
            ),
            Err(_) => None,
        };

        let workers_file = std::env::var("SUBFLEET_WORKERS_FILE").ok().map(PathBuf::from);

        let log_level =
            std::env::var("SUBFLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            hosts,
            min_agent_version,
            max_pending,
            workers_file,
            log_level,
        })
    }
}

/// Parse `name[:disabled]` entries separated by commas.
pub fn parse_hosts(raw: &str) -> Result<Vec<HostDefinition>> {
    let mut hosts = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, enabled) = match entry.split_once(':') {
            None => (entry, true),
            Some((name, "disabled")) => (name, false),
            Some((name, "enabled")) => (name, true),
            Some((_, flag)) => bail!("unknown host flag {flag:?} in {entry:?}"),
        };
        if name.is_empty() || name.contains(' ') {
            bail!("invalid host name {name:?}");
        }
        hosts.push(HostDefinition {
            name: name.to_string(),
            enabled,
        });
    }
    Ok(hosts)
}

/// A worker registered at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkerEntry {
    pub host: String,
    pub spec: WorkerSpec,
}

/// Read the startup worker list.
pub fn load_workers(path: &Path) -> Result<Vec<WorkerEntry>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read workers file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse workers file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("alpha", vec![("alpha", true)])]
    #[case("alpha, beta:disabled", vec![("alpha", true), ("beta", false)])]
    #[case("alpha:enabled,,", vec![("alpha", true)])]
    #[case("", vec![])]
    fn test_parse_hosts(#[case] raw: &str, #[case] expected: Vec<(&str, bool)>) {
        let hosts: Vec<_> = parse_hosts(raw)
            .unwrap()
            .into_iter()
            .map(|h| (h.name, h.enabled))
            .collect();
        let expected: Vec<_> = expected
            .into_iter()
            .map(|(name, enabled)| (name.to_string(), enabled))
            .collect();
        assert_eq!(hosts, expected);
    }

    #[rstest]
    #[case("alpha:paused")]
    #[case(":disabled")]
    #[case("two words")]
    fn test_parse_hosts_rejects(#[case] raw: &str) {
        assert!(parse_hosts(raw).is_err());
    }

    #[test]
    fn test_load_workers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workers.json");
        std::fs::write(
            &path,
            r#"[{"host": "alpha", "spec": {
                "name": "lobby", "port": 25566, "directory": "lobby", "executable": "./start.sh",
                "stop_command": "stop"
            }}]"#,
        )
        .unwrap();

        let workers = load_workers(&path).unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].host, "alpha");
        assert_eq!(workers[0].spec.name, "lobby");
        assert!(workers[0].spec.enabled);
    }

    #[test]
    fn test_load_workers_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_workers(&dir.path().join("absent.json")).is_err());
    }
}
