//! Per-subscriber drain-and-write loop.
//!
//! Each accepted connection gets one task that only consumes that
//! subscriber's outbound queue and writes bytes. Any write error or
//! timeout ends the task; the caller removes the registry entry. A
//! stalled subscriber therefore never holds anything but its own
//! queue.

use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use mesh_protocol::BrokerMessage;

use super::SubscriberId;

/// Write timeout per line; a subscriber slower than this is dropped.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// A registered downstream consumer, as held by the registry.
pub struct Subscriber {
    /// Sender side of the per-connection outbound queue.
    pub queue: mpsc::Sender<String>,

    /// Remote address, for logging.
    pub addr: SocketAddr,

    /// When the connection was accepted.
    pub connected_at: DateTime<Utc>,
}

/// The write loop for one subscriber.
pub struct SubscriberConnection {
    id: SubscriberId,
    addr: SocketAddr,
    reader: OwnedReadHalf,
    writer: BufWriter<OwnedWriteHalf>,
    queue: mpsc::Receiver<String>,
    cancel: CancellationToken,
}

impl SubscriberConnection {
    pub fn new(
        id: SubscriberId,
        addr: SocketAddr,
        stream: TcpStream,
        queue: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            id,
            addr,
            reader,
            writer: BufWriter::new(writer),
            queue,
            cancel,
        }
    }

    /// Runs until disconnect, write failure, queue closure, or shutdown.
    pub async fn run(mut self) {
        // Greet the subscriber so it sees life before the first packet.
        let greeting = match serde_json::to_string(&BrokerMessage::connected_greeting()) {
            Ok(line) => line,
            Err(_) => return,
        };
        if let Err(e) = self.write_line(&greeting).await {
            debug!(subscriber = self.id, error = %e, "Greeting failed");
            return;
        }

        let mut drain_buf = [0u8; 256];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(subscriber = self.id, "Connection closing on shutdown");
                    break;
                }

                line = self.queue.recv() => {
                    match line {
                        Some(line) => {
                            if let Err(e) = self.write_line(&line).await {
                                debug!(
                                    subscriber = self.id,
                                    addr = %self.addr,
                                    error = %e,
                                    "Write failed, closing subscriber"
                                );
                                break;
                            }
                        }
                        // Queue closed: the broadcaster evicted us.
                        None => break,
                    }
                }

                // Push-only protocol: inbound bytes are discarded, but
                // reading them is how we notice the peer went away.
                read = self.reader.read(&mut drain_buf) => {
                    match read {
                        Ok(0) => {
                            debug!(subscriber = self.id, "Subscriber sent EOF");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!(subscriber = self.id, error = %e, "Read failed");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<(), ConnectionError> {
        let write = async {
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.write_all(b"\n").await?;
            self.writer.flush().await?;
            Ok::<(), std::io::Error>(())
        };

        match timeout(WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }
}

/// Errors that can occur on a subscriber connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Write timeout")]
    WriteTimeout,
}
