//! Serialized fan-out point for packets and heartbeats.
//!
//! One bounded mpsc channel carries every [`BrokerEvent`] - upstream
//! packets and heartbeat records alike - into a single broadcaster
//! task. That single consumer is what gives subscribers a consistent
//! order: lines are pushed into every per-subscriber queue before the
//! next event is taken, so all subscribers observe packets in upstream
//! receipt order.
//!
//! Backpressure policy: the channel is bounded and producers block on
//! `send`, throttling upstream ingestion when fan-out falls behind. A
//! subscriber whose own queue is full is treated as a slow reader and
//! removed instead of being allowed to stall the rest.

use mesh_core::NormalizedPacket;
use mesh_protocol::{BrokerMessage, HeartbeatRecord};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::server::SubscriberRegistry;
use crate::stats::StatsCollector;

/// Capacity of the ingest-to-fanout channel.
pub const EVENT_BUFFER: usize = 256;

/// Anything routed through the broadcaster.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// A normalized upstream packet.
    Packet(NormalizedPacket),

    /// A liveness heartbeat.
    Heartbeat(HeartbeatRecord),
}

/// Creates the bounded event channel shared by upstream session,
/// heartbeat emitter, and broadcaster.
pub fn event_channel() -> (mpsc::Sender<BrokerEvent>, mpsc::Receiver<BrokerEvent>) {
    mpsc::channel(EVENT_BUFFER)
}

/// The fan-out task.
pub struct Broadcaster {
    receiver: mpsc::Receiver<BrokerEvent>,
    registry: SubscriberRegistry,
    stats: StatsCollector,
    cancel: CancellationToken,
}

impl Broadcaster {
    pub fn new(
        receiver: mpsc::Receiver<BrokerEvent>,
        registry: SubscriberRegistry,
        stats: StatsCollector,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            receiver,
            registry,
            stats,
            cancel,
        }
    }

    /// Runs until cancellation or until every producer is gone.
    pub async fn run(mut self) {
        info!("Broadcaster starting");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Broadcaster shutting down");
                    break;
                }

                event = self.receiver.recv() => {
                    match event {
                        Some(event) => self.dispatch(event).await,
                        None => {
                            debug!("Event channel closed");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Serializes one event and pushes the line to every subscriber
    /// from a point-in-time registry snapshot.
    async fn dispatch(&self, event: BrokerEvent) {
        let is_packet = matches!(event, BrokerEvent::Packet(_));
        let message = match event {
            BrokerEvent::Packet(packet) => BrokerMessage::packet(packet),
            BrokerEvent::Heartbeat(record) => BrokerMessage::heartbeat(record),
        };

        let line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(e) => {
                // Never aborts the broadcast loop.
                error!(error = %e, "Failed to serialize broadcast line");
                if is_packet {
                    self.stats.record_dropped();
                }
                return;
            }
        };

        let subscribers = self.registry.snapshot().await;
        if subscribers.is_empty() {
            return;
        }

        let mut slow = Vec::new();
        for (id, queue) in subscribers {
            match queue.try_send(line.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = id, "Subscriber queue full, disconnecting slow reader");
                    slow.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Write loop already exited; registry entry is stale.
                    slow.push(id);
                }
            }
        }

        for id in slow {
            if self.registry.remove(id).await {
                debug!(subscriber = id, "Removed unreachable subscriber");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::{NodeId, Portnum};

    fn sample_packet() -> NormalizedPacket {
        NormalizedPacket {
            channel: 0,
            channel_inferred: false,
            portnum: Portnum::new(Portnum::TEXT_MESSAGE),
            from: NodeId::new("!aa"),
            to: NodeId::new("^all"),
            rssi: None,
            snr: None,
            text: Some("hi".to_string()),
            timestamp_received: 1,
        }
    }

    #[tokio::test]
    async fn test_dispatch_preserves_order_per_subscriber() {
        let registry = SubscriberRegistry::new(8);
        let (queue_tx, mut queue_rx) = mpsc::channel(16);
        let addr = "127.0.0.1:9".parse().unwrap();
        registry.add(addr, queue_tx).await.unwrap();

        let (tx, rx) = event_channel();
        let broadcaster = Broadcaster::new(
            rx,
            registry.clone(),
            StatsCollector::new(),
            CancellationToken::new(),
        );

        for i in 0..3u32 {
            let mut pkt = sample_packet();
            pkt.channel = i;
            tx.send(BrokerEvent::Packet(pkt)).await.unwrap();
        }
        drop(tx);
        broadcaster.run().await;

        for i in 0..3u32 {
            let line = queue_rx.recv().await.unwrap();
            assert!(line.contains(&format!("\"channel\":{i}")));
        }
    }

    #[tokio::test]
    async fn test_full_queue_removes_slow_subscriber() {
        let registry = SubscriberRegistry::new(8);

        // Queue of one, never drained: second dispatch must evict.
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let addr = "127.0.0.1:9".parse().unwrap();
        registry.add(addr, slow_tx).await.unwrap();

        let (tx, rx) = event_channel();
        let broadcaster = Broadcaster::new(
            rx,
            registry.clone(),
            StatsCollector::new(),
            CancellationToken::new(),
        );

        tx.send(BrokerEvent::Packet(sample_packet())).await.unwrap();
        tx.send(BrokerEvent::Packet(sample_packet())).await.unwrap();
        drop(tx);
        broadcaster.run().await;

        assert_eq!(registry.count().await, 0);
    }
}
