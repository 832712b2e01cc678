//! Outbound line schema broadcast to subscribers.
//!
//! The broker speaks one-way JSONL: each line is a [`BrokerMessage`]
//! tagged by `type`. Downstream consumers (chat bots, console probes)
//! parse exactly these shapes, so changes must only ever add optional
//! fields.

use mesh_core::{NormalizedPacket, StatsSnapshot};
use serde::{Deserialize, Serialize};

/// Periodic liveness-and-statistics record.
///
/// Rebuilt from scratch each interval; never accumulated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    /// Address of the upstream node this broker relays for.
    pub host: String,

    /// Whether the upstream session is currently connected.
    pub connected: bool,

    /// Number of downstream subscribers at snapshot time.
    pub subscribers: usize,

    /// Counter snapshot.
    pub stats: StatsSnapshot,

    /// Unix timestamp (seconds) the record was built.
    pub timestamp: i64,
}

/// One broadcast line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerMessage {
    /// A normalized upstream packet.
    Packet {
        /// The packet body.
        packet: NormalizedPacket,
    },

    /// Periodic liveness heartbeat, sent on the same path as packets.
    Heartbeat(HeartbeatRecord),

    /// One-shot greeting sent to a subscriber on connect.
    BrokerInfo {
        /// Human-readable status, currently always `connected`.
        msg: String,
    },
}

impl BrokerMessage {
    /// Wraps a normalized packet for broadcast.
    pub fn packet(packet: NormalizedPacket) -> Self {
        Self::Packet { packet }
    }

    /// Wraps a heartbeat record for broadcast.
    pub fn heartbeat(record: HeartbeatRecord) -> Self {
        Self::Heartbeat(record)
    }

    /// The greeting pushed to every freshly accepted subscriber.
    pub fn connected_greeting() -> Self {
        Self::BrokerInfo {
            msg: "connected".to_string(),
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
            from: NodeId::new("!a1b2c3d4"),
            to: NodeId::new("^all"),
            rssi: None,
            snr: None,
            text: Some("Hola".to_string()),
            timestamp_received: 1_700_000_000,
        }
    }

    #[test]
    fn test_packet_line_schema() {
        let json = serde_json::to_string(&BrokerMessage::packet(sample_packet())).unwrap();
        assert!(json.starts_with("{\"type\":\"packet\""));
        assert!(json.contains("\"packet\":{"));
        assert!(json.contains("\"portnum\":\"TEXT_MESSAGE_APP\""));
        assert!(json.contains("\"text\":\"Hola\""));
    }

    #[test]
    fn test_heartbeat_line_schema() {
        let mut stats = StatsSnapshot::default();
        stats.total = 12;
        stats.by_channel.insert(0, 12);
        let msg = BrokerMessage::heartbeat(HeartbeatRecord {
            host: "192.168.1.201".to_string(),
            connected: true,
            subscribers: 3,
            stats,
            timestamp: 1_700_000_123,
        });

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.starts_with("{\"type\":\"heartbeat\""));
        assert!(json.contains("\"host\":\"192.168.1.201\""));
        assert!(json.contains("\"connected\":true"));
        assert!(json.contains("\"subscribers\":3"));
        assert!(json.contains("\"stats\":{\"total\":12"));
        assert!(json.contains("\"byChannel\":{\"0\":12}"));
    }

    #[test]
    fn test_broker_info_greeting() {
        let json = serde_json::to_string(&BrokerMessage::connected_greeting()).unwrap();
        assert_eq!(json, "{\"type\":\"broker_info\",\"msg\":\"connected\"}");
    }

    #[test]
    fn test_message_roundtrip() {
        let original = BrokerMessage::packet(sample_packet());
        let json = serde_json::to_string(&original).unwrap();
        let parsed: BrokerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, original);
    }
}
