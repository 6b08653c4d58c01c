//! Newline-delimited JSON framing.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{Packet, ProtoError};

/// Largest accepted line, newline included.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Serialize a packet as one line, trailing newline included.
pub fn encode(packet: &Packet) -> Result<String, ProtoError> {
    let mut line = serde_json::to_string(packet)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line into a packet.
pub fn decode(line: &str) -> Result<Packet, ProtoError> {
    Ok(serde_json::from_str(line.trim_end())?)
}

/// Reads packets from a byte stream.
pub struct PacketReader<R> {
    inner: BufReader<R>,
    /// Bytes of the line being assembled. Survives cancellation.
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    /// Next packet, or `None` once the peer has closed the stream.
    ///
    /// Blank lines are skipped. A malformed line is an error but leaves the
    /// reader positioned at the next line.
    ///
    /// Cancel safe: a partially read line is kept for the next call, so this
    /// can be used as a `tokio::select!` branch.
    pub async fn next(&mut self) -> Result<Option<Packet>, ProtoError> {
        loop {
            let budget = (MAX_FRAME_BYTES + 1).saturating_sub(self.buf.len()) as u64;
            let read = (&mut self.inner)
                .take(budget)
                .read_until(b'\n', &mut self.buf)
                .await?;

            if self.buf.len() > MAX_FRAME_BYTES {
                let size = self.buf.len();
                self.buf.clear();
                return Err(ProtoError::FrameTooLarge {
                    size,
                    limit: MAX_FRAME_BYTES,
                });
            }
            if read == 0 && self.buf.is_empty() {
                return Ok(None);
            }
            if read > 0 && !self.buf.ends_with(b"\n") {
                // Stream ended mid-line; the next read returns 0 and the
                // tail is parsed as a final line.
                continue;
            }

            let line = std::mem::take(&mut self.buf);
            let text = std::str::from_utf8(&line)
                .map_err(|e| ProtoError::Malformed(format!("invalid utf-8: {e}")))?;
            if text.trim().is_empty() {
                continue;
            }
            return decode(text).map(Some);
        }
    }
}

/// Writes packets to a byte stream.
pub struct PacketWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { inner: writer }
    }

    pub async fn send(&mut self, packet: &Packet) -> Result<(), ProtoError> {
        let line = encode(packet)?;
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtoError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ResponseCode, WorkerSpec};

    #[test]
    fn test_encode_is_single_line() {
        let packet = Packet::AddWorker {
            request_id: Some(1),
            spec: WorkerSpec::new("lobby", "./start.sh", "stop"),
            log_address: None,
        };
        let line = encode(&packet).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert_eq!(decode(&line).unwrap(), packet);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode("{\"type\":\"nope\"}").unwrap_err();
        assert!(matches!(err, ProtoError::Malformed(_)));
        assert!(!err.is_disconnect());
    }

    #[tokio::test]
    async fn test_reader_writer_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = PacketWriter::new(client);
        let mut reader = PacketReader::new(server);

        writer
            .send(&Packet::response(3, ResponseCode::Success))
            .await
            .unwrap();
        writer
            .send(&Packet::Reset {
                reason: "Prevent Desync".to_string(),
            })
            .await
            .unwrap();
        writer.shutdown().await.unwrap();

        let first = reader.next().await.unwrap().unwrap();
        assert_eq!(first.request_id(), Some(3));
        let second = reader.next().await.unwrap().unwrap();
        assert_eq!(second.kind(), "reset");
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_skips_blank_lines_and_recovers() {
        let input: &[u8] = b"\n\nnot json\n{\"type\":\"reset\",\"reason\":\"x\"}\n";
        let mut reader = PacketReader::new(input);

        assert!(reader.next().await.is_err());
        let packet = reader.next().await.unwrap().unwrap();
        assert_eq!(packet.kind(), "reset");
    }
}
