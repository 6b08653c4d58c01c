//! Controller link - keeps this host connected to the controller.
//!
//! The link client:
//! - Connects to the controller and announces the host with a `link` packet
//! - Hands every controller packet to the [`HostAgent`] in arrival order
//! - Forwards responses and worker status upstream
//! - Reconnects with exponential backoff when the connection drops
//!
//! Packets produced while disconnected are discarded on reconnect; the
//! controller rebuilds its view from the resync that follows every link.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use subfleet_proto::codec::{PacketReader, PacketWriter};
use subfleet_proto::{LinkStatus, Packet, Version};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::agent::HostAgent;

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Upper bound before jitter.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        let delay = self.base.saturating_mul(factor).min(self.max);

        let spread = delay.as_secs_f64() * self.jitter.clamp(0.0, 1.0);
        Duration::from_secs_f64((delay.as_secs_f64() + spread * unit_noise()).max(0.0))
    }
}

/// Uniform noise in [-1.0, 1.0].
fn unit_noise() -> f64 {
    rand::rng().random_range(-1.0..=1.0)
}

// =============================================================================
// Link Client
// =============================================================================

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Linked and processing packets.
    Connected,
    /// Waiting before a reconnect attempt.
    BackoffWait,
}

/// Link client settings.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub controller_addr: String,
    pub host: String,
    /// Channel slot to bind; 0 is the control channel.
    pub channel: u32,
    pub agent_version: Version,
    pub backoff: BackoffPolicy,
}

/// Maintains the connection to the controller.
pub struct LinkClient {
    config: LinkConfig,
    agent: Arc<HostAgent>,
    outbound: mpsc::UnboundedReceiver<Packet>,
    state: watch::Sender<ConnectionState>,
    consecutive_failures: u32,
}

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

impl LinkClient {
    pub fn new(
        config: LinkConfig,
        agent: Arc<HostAgent>,
        outbound: mpsc::UnboundedReceiver<Packet>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            agent,
            outbound,
            state,
            consecutive_failures: 0,
        }
    }

    /// Watch connection state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            info!(
                host = %self.config.host,
                addr = %self.config.controller_addr,
                channel = self.config.channel,
                "Connecting to controller"
            );

            let reason = match self.session(&mut shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Dropped(reason)) => reason,
                Err(e) => format!("{e:#}"),
            };

            self.set_state(ConnectionState::BackoffWait);
            let delay = self.config.backoff.delay(self.consecutive_failures);
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            warn!(
                host = %self.config.host,
                reason = %reason,
                failures = self.consecutive_failures,
                delay_ms = delay.as_millis() as u64,
                "Controller link down, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!(host = %self.config.host, "Controller link stopped");
    }

    async fn session(&mut self, shutdown: &mut watch::Receiver<bool>) -> anyhow::Result<SessionEnd> {
        let stream = TcpStream::connect(&self.config.controller_addr).await?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = PacketReader::new(read_half);
        let mut writer = PacketWriter::new(write_half);

        writer
            .send(&Packet::Link {
                host: self.config.host.clone(),
                channel: self.config.channel,
                agent_version: self.config.agent_version.clone(),
            })
            .await?;

        match reader.next().await? {
            Some(Packet::Linked {
                status: LinkStatus::Linked,
                ..
            }) => {}
            Some(Packet::Linked { status, message }) => {
                return Ok(SessionEnd::Dropped(format!(
                    "link refused: {status:?} {}",
                    message.unwrap_or_default()
                )));
            }
            Some(other) => anyhow::bail!("expected linked, got {}", other.kind()),
            None => return Ok(SessionEnd::Dropped("closed during link".to_string())),
        }

        // Anything queued while offline describes a state the resync replaces.
        let mut stale = 0usize;
        while self.outbound.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!(count = stale, "Discarded packets queued while offline");
        }

        self.consecutive_failures = 0;
        self.set_state(ConnectionState::Connected);
        info!(host = %self.config.host, "Linked to controller");

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = writer.shutdown().await;
                        return Ok(SessionEnd::Shutdown);
                    }
                }

                incoming = reader.next() => match incoming {
                    Ok(Some(packet)) => self.agent.handle(packet).await,
                    Ok(None) => return Ok(SessionEnd::Dropped("controller closed the link".to_string())),
                    Err(e) if e.is_disconnect() => return Ok(SessionEnd::Dropped(e.to_string())),
                    Err(e) => warn!(error = %e, "Ignoring malformed packet"),
                },

                outgoing = self.outbound.recv() => match outgoing {
                    Some(packet) => writer.send(&packet).await?,
                    None => return Ok(SessionEnd::Shutdown),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            jitter: 0.0,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(10), Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let policy = BackoffPolicy::default();
        for _ in 0..100 {
            let d = policy.delay(1);
            assert!(d >= Duration::from_millis(150));
            assert!(d <= Duration::from_millis(250));
        }
    }
}
