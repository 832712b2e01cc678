//! Process-lifetime packet counters.
//!
//! The collector is the sole mutator of the counters; everything else
//! reads through [`StatsCollector::snapshot`]. All three counters for a
//! normalized packet (`total`, per-channel, per-portnum) move under one
//! lock acquisition, so no error path can observe a half-updated set.
//! The lock is plain `std::sync::Mutex` and is never held across an
//! `.await`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use mesh_core::{ChannelIndex, NormalizedPacket, StatsSnapshot};
use tracing::warn;

#[derive(Debug, Default)]
struct StatsInner {
    total: u64,
    by_channel: BTreeMap<ChannelIndex, u64>,
    by_portnum: BTreeMap<String, u64>,
    undecoded: u64,
    dropped: u64,
}

/// Cheap-to-clone handle over the broker's counters.
#[derive(Debug, Clone, Default)]
pub struct StatsCollector {
    inner: Arc<Mutex<StatsInner>>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a successfully normalized packet.
    pub fn record_packet(&self, packet: &NormalizedPacket) {
        let Ok(mut inner) = self.inner.lock() else {
            warn!("stats lock poisoned, packet not counted");
            return;
        };
        inner.total += 1;
        *inner.by_channel.entry(packet.channel).or_insert(0) += 1;
        *inner
            .by_portnum
            .entry(packet.portnum.as_str().to_string())
            .or_insert(0) += 1;
    }

    /// Counts an event whose payload could not be decoded.
    ///
    /// Undecoded events are tracked separately and never touch `total`.
    pub fn record_undecoded(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.undecoded += 1;
        }
    }

    /// Counts an event discarded entirely (unparseable line,
    /// unrecognized shape, or serialization failure at fan-out).
    pub fn record_dropped(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.dropped += 1;
        }
    }

    /// Immutable snapshot for heartbeats and status queries.
    pub fn snapshot(&self) -> StatsSnapshot {
        match self.inner.lock() {
            Ok(inner) => StatsSnapshot {
                total: inner.total,
                by_channel: inner.by_channel.clone(),
                by_portnum: inner.by_portnum.clone(),
                undecoded: inner.undecoded,
                dropped: inner.dropped,
            },
            Err(_) => StatsSnapshot::default(),
        }
    }
}
