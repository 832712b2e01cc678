//! Periodic liveness heartbeats.
//!
//! Each tick combines session connectivity, a stats snapshot, and the
//! subscriber count into one [`HeartbeatRecord`] and routes it through
//! the broadcaster channel - the same path packets take, so
//! subscribers get liveness information without a side channel.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use mesh_protocol::HeartbeatRecord;

use crate::broadcast::BrokerEvent;
use crate::server::SubscriberRegistry;
use crate::stats::StatsCollector;
use crate::upstream::SessionStatus;

/// Default interval between heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// The heartbeat timer task.
pub struct HeartbeatEmitter {
    host: String,
    period: Duration,
    status: SessionStatus,
    stats: StatsCollector,
    registry: SubscriberRegistry,
    events: mpsc::Sender<BrokerEvent>,
    cancel: CancellationToken,
}

impl HeartbeatEmitter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: impl Into<String>,
        period: Duration,
        status: SessionStatus,
        stats: StatsCollector,
        registry: SubscriberRegistry,
        events: mpsc::Sender<BrokerEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            host: host.into(),
            period,
            status,
            stats,
            registry,
            events,
            cancel,
        }
    }

    /// Emits one heartbeat per interval until shutdown or until the
    /// broadcaster is gone.
    pub async fn run(self) {
        info!(period_secs = self.period.as_secs(), "Heartbeat emitter starting");
        let mut ticker = interval(self.period);
        // The first tick fires immediately; skip it so subscribers see
        // the greeting before the first heartbeat.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Heartbeat emitter shutting down");
                    break;
                }

                _ = ticker.tick() => {
                    let record = self.build_record().await;
                    if self.events.send(BrokerEvent::Heartbeat(record)).await.is_err() {
                        debug!("Heartbeat emitter stopping: event channel closed");
                        break;
                    }
                }
            }
        }
    }

    async fn build_record(&self) -> HeartbeatRecord {
        HeartbeatRecord {
            host: self.host.clone(),
            connected: self.status.is_connected(),
            subscribers: self.registry.count().await,
            stats: self.stats.snapshot(),
            timestamp: Utc::now().timestamp(),
        }
    }
}
