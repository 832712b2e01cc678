//! Counter snapshot carried by heartbeats.

use crate::packet::ChannelIndex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Immutable point-in-time view of the broker's counters.
///
/// Built by the daemon's stats collector and embedded in every
/// heartbeat line. Map keys serialize as strings in JSON, matching the
/// `{"byChannel":{"0":12}}` shape downstream consumers parse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Packets successfully normalized since startup.
    pub total: u64,

    /// Normalized packets per routing channel.
    #[serde(rename = "byChannel")]
    pub by_channel: BTreeMap<ChannelIndex, u64>,

    /// Normalized packets per portnum.
    #[serde(rename = "byPortnum")]
    pub by_portnum: BTreeMap<String, u64>,

    /// Events whose payload could not be decoded (not part of `total`).
    pub undecoded: u64,

    /// Events discarded entirely (unparseable or unserializable).
    pub dropped: u64,
}

impl StatsSnapshot {
    /// Sum of the per-channel counters. Equals `total` as long as
    /// every normalized packet was counted against exactly one channel.
    pub fn channel_sum(&self) -> u64 {
        self.by_channel.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_keys_serialize_as_strings() {
        let mut snap = StatsSnapshot::default();
        snap.total = 3;
        snap.by_channel.insert(0, 2);
        snap.by_channel.insert(5, 1);
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"byChannel\":{\"0\":2,\"5\":1}"));
        assert!(json.contains("\"total\":3"));
    }

    #[test]
    fn test_channel_sum_matches_total() {
        let mut snap = StatsSnapshot::default();
        snap.total = 7;
        snap.by_channel.insert(0, 4);
        snap.by_channel.insert(2, 2);
        snap.by_channel.insert(5, 1);
        assert_eq!(snap.channel_sum(), snap.total);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut snap = StatsSnapshot::default();
        snap.total = 1;
        snap.by_portnum.insert("TEXT_MESSAGE_APP".to_string(), 1);
        snap.undecoded = 2;
        let json = serde_json::to_string(&snap).unwrap();
        let parsed: StatsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, snap);
    }
}
