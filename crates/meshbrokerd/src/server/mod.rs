//! TCP listener and subscriber registry.
//!
//! The server:
//! - Binds the configured address/port (bind failure is fatal at startup)
//! - Accepts subscriber connections and registers them
//! - Spawns one drain-and-write loop per subscriber
//! - Supports graceful shutdown via CancellationToken
//!
//! The protocol is push-only JSONL: subscribers receive lines and are
//! never expected to send anything. Inbound bytes are drained and
//! discarded; EOF on the read side is how disconnects are noticed.

mod connection;

pub use connection::{ConnectionError, Subscriber, SubscriberConnection};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Maximum number of concurrent subscribers.
pub const MAX_SUBSCRIBERS: usize = 64;

/// Capacity of each subscriber's outbound line queue.
pub const SUBSCRIBER_QUEUE: usize = 128;

/// Unique identifier for a subscriber connection.
pub type SubscriberId = u64;

/// Concurrency-safe set of active subscribers.
///
/// Mutations take the write lock; broadcast takes a point-in-time
/// [`snapshot`](SubscriberRegistry::snapshot) so per-subscriber I/O
/// never holds the lock against new accepts or removals.
#[derive(Clone)]
pub struct SubscriberRegistry {
    inner: Arc<RwLock<HashMap<SubscriberId, Subscriber>>>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

impl SubscriberRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            capacity,
        }
    }

    /// Registers a subscriber, returning its assigned id.
    pub async fn add(
        &self,
        addr: SocketAddr,
        queue: mpsc::Sender<String>,
    ) -> Result<SubscriberId, ServerError> {
        let mut subs = self.inner.write().await;
        if subs.len() >= self.capacity {
            return Err(ServerError::TooManySubscribers { max: self.capacity });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        subs.insert(
            id,
            Subscriber {
                queue,
                addr,
                connected_at: Utc::now(),
            },
        );
        debug!(subscriber = id, addr = %addr, "Added subscriber");
        Ok(id)
    }

    /// Removes a subscriber. Returns false if it was already gone.
    pub async fn remove(&self, id: SubscriberId) -> bool {
        let mut subs = self.inner.write().await;
        subs.remove(&id).is_some()
    }

    /// Number of active subscribers.
    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Point-in-time view of (id, queue) pairs for broadcasting.
    pub async fn snapshot(&self) -> Vec<(SubscriberId, mpsc::Sender<String>)> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(id, sub)| (*id, sub.queue.clone()))
            .collect()
    }

    /// Drops every subscriber, closing their queues.
    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }
}

/// TCP fan-out server for the broker.
pub struct BrokerServer {
    bind_addr: String,
    registry: SubscriberRegistry,
    cancel: CancellationToken,
}

impl BrokerServer {
    /// Creates a new server.
    ///
    /// `bind_addr` is the full `host:port` to listen on; `registry`
    /// is the shared subscriber set the broadcaster snapshots.
    pub fn new(
        bind_addr: impl Into<String>,
        registry: SubscriberRegistry,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            registry,
            cancel,
        }
    }

    /// Runs the accept loop until the cancellation token fires.
    ///
    /// Returns an error only for bind failure, which callers treat as
    /// fatal; accept errors are logged and the loop continues.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener =
            TcpListener::bind(&self.bind_addr)
                .await
                .map_err(|e| ServerError::Bind {
                    addr: self.bind_addr.clone(),
                    error: e.to_string(),
                })?;

        info!(addr = %self.bind_addr, "Broker server listening");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.handle_accept(stream, addr).await,
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.registry.clear().await;
        info!("Server cleanup complete");
        Ok(())
    }

    /// Returns the address the server was configured for.
    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    async fn handle_accept(&self, stream: tokio::net::TcpStream, addr: SocketAddr) {
        let (queue_tx, queue_rx) = mpsc::channel(SUBSCRIBER_QUEUE);

        let id = match self.registry.add(addr, queue_tx).await {
            Ok(id) => id,
            Err(e) => {
                warn!(addr = %addr, error = %e, "Rejecting subscriber");
                return;
            }
        };

        info!(subscriber = id, addr = %addr, "Subscriber connected");

        let registry = self.registry.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let conn = SubscriberConnection::new(id, addr, stream, queue_rx, cancel);
            conn.run().await;

            if registry.remove(id).await {
                debug!(subscriber = id, "Removed disconnected subscriber");
            }
            info!(subscriber = id, addr = %addr, "Subscriber disconnected");
        });
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listen socket could not be bound. Fatal at startup.
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: String, error: String },

    /// The subscriber limit was reached.
    #[error("Too many subscribers (max: {max})")]
    TooManySubscribers { max: usize },
}
