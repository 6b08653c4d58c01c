//! TCP listener accepting host agent links.
//!
//! ## Handshake
//!
//! ```text
//! host                          controller
//!  | --- Link{host, channel} ---> |  unknown host      -> Linked{unknown_host}, close
//!  |                              |  agent too old     -> Linked{unsupported_version}, close
//!  |                              |  slot occupied     -> Linked{already_linked}, close
//!  | <-- Linked{linked} --------- |  bound; resync packets follow
//! ```
//!
//! After the handshake every frame goes to the host actor. EOF or a read
//! error unbinds the connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use subfleet_proto::codec::{PacketReader, PacketWriter};
use subfleet_proto::{LinkStatus, Packet, ProtoError, Version};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::host::{BindOutcome, Connection, HostHandle};
use crate::registry::HostRegistry;

/// Time a new connection gets to send its link request.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts host links and hands them to host actors.
pub struct LinkListener {
    registry: Arc<HostRegistry>,
    min_agent_version: Version,
    next_connection: AtomicU64,
}

impl LinkListener {
    pub fn new(registry: Arc<HostRegistry>, min_agent_version: Version) -> Arc<Self> {
        Arc::new(Self {
            registry,
            min_agent_version,
            next_connection: AtomicU64::new(1),
        })
    }

    /// Accept connections until shutdown is signaled.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        info!(addr = ?listener.local_addr().ok(), "Link listener started");
        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Link listener shutting down");
                        break;
                    }
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let this = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = this.handle_connection(stream, peer).await {
                                    warn!(peer = %peer, error = %e, "Host connection failed");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "Failed to accept connection"),
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), LinkError> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = PacketReader::new(read_half);
        let mut writer = PacketWriter::new(write_half);

        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.next())
            .await
            .map_err(|_| LinkError::HandshakeTimeout)??;
        let (host_name, slot, agent_version) = match first {
            Some(Packet::Link {
                host,
                channel,
                agent_version,
            }) => (host, channel, agent_version),
            Some(other) => {
                return Err(LinkError::Handshake(format!(
                    "expected link, got {}",
                    other.kind()
                )))
            }
            None => return Err(LinkError::Handshake("closed before link".to_string())),
        };

        let Some(host) = self.registry.host(&host_name).await else {
            info!(peer = %peer, host = %host_name, "Link from unknown host refused");
            return refuse(&mut writer, LinkStatus::UnknownHost, format!("unknown host {host_name}")).await;
        };

        if agent_version < self.min_agent_version {
            info!(
                peer = %peer,
                host = %host_name,
                agent_version = %agent_version,
                required = %self.min_agent_version,
                "Link from outdated agent refused"
            );
            let message = format!("agent {agent_version} is older than {}", self.min_agent_version);
            return refuse(&mut writer, LinkStatus::UnsupportedVersion, message).await;
        }

        let id = self.next_connection.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        if host.bind(slot, Connection::new(id, tx)).await? == BindOutcome::AlreadyLinked {
            return refuse(&mut writer, LinkStatus::AlreadyLinked, format!("slot {slot} in use")).await;
        }

        info!(peer = %peer, host = %host.name(), slot, connection = id, "Host linked");
        let result = session(&host, reader, writer, rx).await;
        if let Err(e) = host.unbind(id).await {
            debug!(host = %host.name(), error = %e, "Host actor gone before unbind");
        }
        info!(peer = %peer, host = %host.name(), slot, connection = id, "Host link closed");
        result
    }
}

async fn refuse(
    writer: &mut PacketWriter<OwnedWriteHalf>,
    status: LinkStatus,
    message: String,
) -> Result<(), LinkError> {
    writer
        .send(&Packet::Linked {
            status,
            message: Some(message),
        })
        .await?;
    writer.shutdown().await?;
    Ok(())
}

/// Pump packets both ways until the host goes away.
///
/// Packets the actor queued for this connection wait in `rx` until the
/// `Linked` answer is on the wire.
async fn session(
    host: &HostHandle,
    mut reader: PacketReader<OwnedReadHalf>,
    mut writer: PacketWriter<OwnedWriteHalf>,
    mut rx: mpsc::UnboundedReceiver<Packet>,
) -> Result<(), LinkError> {
    writer
        .send(&Packet::Linked {
            status: LinkStatus::Linked,
            message: None,
        })
        .await?;

    let host_name = host.name().to_string();
    let writer_task = tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            if let Err(e) = writer.send(&packet).await {
                debug!(host = %host_name, error = %e, "Write to host failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let result = loop {
        match reader.next().await {
            Ok(Some(packet)) => {
                if let Err(e) = host.deliver(packet).await {
                    break Err(e.into());
                }
            }
            Ok(None) => break Ok(()),
            Err(e) if e.is_disconnect() => break Ok(()),
            Err(ProtoError::Malformed(reason)) => {
                warn!(host = %host.name(), error = %reason, "Skipping malformed packet");
            }
            Err(e) => break Err(e.into()),
        }
    };

    writer_task.abort();
    result
}
