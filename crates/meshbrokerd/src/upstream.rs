//! Upstream session to the mesh-radio node.
//!
//! The session is the single owner of the node connection. It reads
//! the node's JSONL event feed, normalizes every event, and forwards
//! the outcome into the broadcaster channel. Link loss - read error,
//! EOF, or silence past the health-check interval - drops the session
//! back to reconnecting with exponential backoff, while the fan-out
//! path keeps serving already-connected subscribers untouched.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mesh_protocol::{normalize, ChannelExtractor, Normalized};

use crate::broadcast::BrokerEvent;
use crate::stats::StatsCollector;

/// Default TCP port of the node's event feed.
pub const DEFAULT_NODE_PORT: u16 = 4403;

/// First retry delay after a failed connection.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Retry delay ceiling.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// How long to wait for a connection attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Silence longer than this is treated as link loss.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(120);

/// Lifecycle of the upstream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    /// Terminal; only set on shutdown.
    Closed = 3,
}

/// Shared, lock-free view of the session state.
///
/// The heartbeat emitter reads this each interval; the session is the
/// only writer.
#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    state: Arc<AtomicU8>,
}

impl SessionStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> SessionState {
        match self.state.load(Ordering::Relaxed) {
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            3 => SessionState::Closed,
            _ => SessionState::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.get() == SessionState::Connected
    }

    pub(crate) fn set(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }
}

/// Why a connected feed ended.
enum FeedEnd {
    Eof,
    ReadError,
    IdleTimeout,
    PipelineClosed,
    Shutdown,
}

/// The single session to the upstream node.
pub struct UpstreamSession {
    node_addr: String,
    extractor: ChannelExtractor,
    stats: StatsCollector,
    events: mpsc::Sender<BrokerEvent>,
    status: SessionStatus,
    cancel: CancellationToken,
}

impl UpstreamSession {
    pub fn new(
        node_addr: impl Into<String>,
        extractor: ChannelExtractor,
        stats: StatsCollector,
        events: mpsc::Sender<BrokerEvent>,
        status: SessionStatus,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            node_addr: node_addr.into(),
            extractor,
            stats,
            events,
            status,
            cancel,
        }
    }

    /// Connect / read / reconnect loop. Runs until shutdown; upstream
    /// failures are never fatal, only surfaced as `connected=false`.
    pub async fn run(self) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.status.set(SessionState::Connecting);
            debug!(node = %self.node_addr, "Connecting to node");

            match timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.node_addr)).await {
                Ok(Ok(stream)) => {
                    self.status.set(SessionState::Connected);
                    info!(node = %self.node_addr, "Connected to node");
                    backoff = INITIAL_BACKOFF;

                    match self.read_feed(stream).await {
                        FeedEnd::Shutdown => break,
                        FeedEnd::PipelineClosed => {
                            // Broadcaster gone; nothing left to relay to.
                            warn!("Fan-out pipeline closed, stopping upstream session");
                            break;
                        }
                        FeedEnd::Eof => warn!(node = %self.node_addr, "Node closed the feed"),
                        FeedEnd::ReadError => {
                            warn!(node = %self.node_addr, "Node feed read failed")
                        }
                        FeedEnd::IdleTimeout => warn!(
                            node = %self.node_addr,
                            idle_secs = HEALTH_CHECK_INTERVAL.as_secs(),
                            "No traffic within health-check interval, reconnecting"
                        ),
                    }
                }
                Ok(Err(e)) => {
                    debug!(node = %self.node_addr, error = %e, "Connection failed");
                }
                Err(_) => {
                    debug!(node = %self.node_addr, "Connection attempt timed out");
                }
            }

            self.status.set(SessionState::Disconnected);

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        self.status.set(SessionState::Closed);
        info!("Upstream session closed");
    }

    /// Reads the JSONL feed line by line until the link dies.
    async fn read_feed(&self, stream: TcpStream) -> FeedEnd {
        let mut lines = BufReader::new(stream).lines();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return FeedEnd::Shutdown,

                result = timeout(HEALTH_CHECK_INTERVAL, lines.next_line()) => {
                    match result {
                        Err(_) => return FeedEnd::IdleTimeout,
                        Ok(Ok(None)) => return FeedEnd::Eof,
                        Ok(Err(e)) => {
                            debug!(error = %e, "Feed read error");
                            return FeedEnd::ReadError;
                        }
                        Ok(Ok(Some(line))) => {
                            if self.ingest(&line).await.is_err() {
                                return FeedEnd::PipelineClosed;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Parses and normalizes one feed line, updating stats and
    /// forwarding the packet. Only a closed pipeline is an error;
    /// malformed events are counted and skipped.
    async fn ingest(&self, line: &str) -> Result<(), mpsc::error::SendError<BrokerEvent>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }

        let event: serde_json::Value = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "Unparseable feed line dropped");
                self.stats.record_dropped();
                return Ok(());
            }
        };

        match normalize(&event, &self.extractor) {
            Ok(Normalized::Packet(packet)) => {
                debug!(
                    channel = packet.channel,
                    portnum = %packet.portnum,
                    from = %packet.from,
                    to = %packet.to,
                    "rx packet"
                );
                self.stats.record_packet(&packet);
                // Bounded send: blocks here when fan-out lags.
                self.events.send(BrokerEvent::Packet(packet)).await
            }
            Ok(Normalized::Undecoded(packet)) => {
                debug!(channel = packet.channel, from = %packet.from, "rx undecoded packet");
                self.stats.record_undecoded();
                self.events.send(BrokerEvent::Packet(packet)).await
            }
            Err(e) => {
                debug!(error = %e, "Event dropped during normalization");
                self.stats.record_dropped();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn session_with(
        addr: String,
        events: mpsc::Sender<BrokerEvent>,
        cancel: CancellationToken,
    ) -> (UpstreamSession, SessionStatus, StatsCollector) {
        let status = SessionStatus::new();
        let stats = StatsCollector::new();
        let session = UpstreamSession::new(
            addr,
            ChannelExtractor::new(0),
            stats.clone(),
            events,
            status.clone(),
            cancel,
        );
        (session, status, stats)
    }

    #[test]
    fn test_session_status_transitions() {
        let status = SessionStatus::new();
        assert_eq!(status.get(), SessionState::Disconnected);
        assert!(!status.is_connected());

        status.set(SessionState::Connected);
        assert!(status.is_connected());

        status.set(SessionState::Closed);
        assert_eq!(status.get(), SessionState::Closed);
        assert!(!status.is_connected());
    }

    #[tokio::test]
    async fn test_ingest_counts_and_forwards() {
        let (tx, mut rx) = mpsc::channel(8);
        let (session, _, stats) =
            session_with("127.0.0.1:1".to_string(), tx, CancellationToken::new());

        let line = r#"{"decoded":{"portnum":"TEXT_MESSAGE_APP","header":{"channelIndex":2,"fromId":"!aa","toId":"^all"},"data":{"text":"hey"}}}"#;
        session.ingest(line).await.unwrap();

        let snap = stats.snapshot();
        assert_eq!(snap.total, 1);
        assert_eq!(snap.by_channel.get(&2), Some(&1));

        let Some(BrokerEvent::Packet(packet)) = rx.recv().await else {
            panic!("expected packet event");
        };
        assert_eq!(packet.text.as_deref(), Some("hey"));
    }

    #[tokio::test]
    async fn test_ingest_drops_garbage_without_failing() {
        let (tx, mut rx) = mpsc::channel(8);
        let (session, _, stats) =
            session_with("127.0.0.1:1".to_string(), tx, CancellationToken::new());

        session.ingest("not json at all").await.unwrap();
        session.ingest(r#"{"uptime": 4}"#).await.unwrap();
        session.ingest("").await.unwrap();

        assert_eq!(stats.snapshot().dropped, 2);
        assert_eq!(stats.snapshot().total, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_session_connects_and_reads_feed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let (session, status, _) = session_with(addr, tx, cancel.clone());
        tokio::spawn(session.run());

        let (mut node_side, _) = listener.accept().await.unwrap();
        node_side
            .write_all(b"{\"decoded\":{\"portnum\":\"TEXT_MESSAGE_APP\",\"header\":{\"channelIndex\":0,\"fromId\":\"!aa\",\"toId\":\"^all\"},\"data\":{\"text\":\"Hola\"}}}\n")
            .await
            .unwrap();

        let Some(BrokerEvent::Packet(packet)) = rx.recv().await else {
            panic!("expected packet event");
        };
        assert_eq!(packet.text.as_deref(), Some("Hola"));
        assert!(status.is_connected());

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_flips_status_and_session_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let (session, status, _) = session_with(addr, tx, cancel.clone());
        tokio::spawn(session.run());

        let (node_side, _) = listener.accept().await.unwrap();
        // Wait for the session to mark itself connected.
        for _ in 0..100 {
            if status.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(status.is_connected());

        drop(node_side);
        for _ in 0..100 {
            if !status.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!status.is_connected());

        // The session keeps retrying: a second accept must succeed.
        let accepted = timeout(Duration::from_secs(5), listener.accept()).await;
        assert!(accepted.is_ok());

        cancel.cancel();
    }
}
