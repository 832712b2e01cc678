//! Channel resolution from variable-shaped node events.
//!
//! The node feed is not uniform: depending on message type and firmware
//! revision the channel index shows up under different keys, in snake
//! or camel case, or not at all. Resolution is therefore an ordered
//! list of typed strategies, each probing one known location, tried in
//! sequence until one matches. When none does, the configured default
//! channel is used and the result is marked inferred.

use mesh_core::ChannelIndex;
use serde_json::Value;

/// A single known location for the channel index.
///
/// Strategies are tried in [`ChannelStrategy::ORDER`]; each returns
/// `Some` only for an integer value at its location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStrategy {
    /// `decoded.header.channelIndex` / `decoded.header.channel_index` -
    /// the usual location on decoded packets.
    DecodedHeader,

    /// `rxMetadata.channel` / `rx_metadata.channel` - radio metadata,
    /// present on some firmware even when the payload is encrypted.
    RxMetadata,

    /// `decoded.channel` / `decoded.channel_index` - older firmware
    /// puts the index directly on the decoded sub-payload.
    DecodedPayload,

    /// A bare `channel` field on the event itself.
    TopLevel,
}

impl ChannelStrategy {
    /// Priority order: explicit header first, metadata, payload,
    /// then the loose top-level field.
    pub const ORDER: [ChannelStrategy; 4] = [
        ChannelStrategy::DecodedHeader,
        ChannelStrategy::RxMetadata,
        ChannelStrategy::DecodedPayload,
        ChannelStrategy::TopLevel,
    ];

    /// Probes the event at this strategy's location.
    pub fn probe(&self, event: &Value) -> Option<ChannelIndex> {
        let paths: &[&[&str]] = match self {
            Self::DecodedHeader => &[
                &["decoded", "header", "channelIndex"],
                &["decoded", "header", "channel_index"],
            ],
            Self::RxMetadata => &[
                &["rxMetadata", "channel"],
                &["rx_metadata", "channel"],
            ],
            Self::DecodedPayload => &[
                &["decoded", "channel"],
                &["decoded", "channel_index"],
            ],
            Self::TopLevel => &[&["channel"]],
        };

        paths.iter().find_map(|path| get_u32(event, path))
    }
}

/// Walks a key path through nested JSON objects, returning the value
/// only if every intermediate node is an object.
fn get_path<'a>(event: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = event;
    for key in path {
        cur = cur.as_object()?.get(*key)?;
    }
    Some(cur)
}

fn get_u32(event: &Value, path: &[&str]) -> Option<ChannelIndex> {
    get_path(event, path)
        .and_then(Value::as_u64)
        .and_then(|v| ChannelIndex::try_from(v).ok())
}

/// Outcome of channel resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelResolution {
    /// The resolved (or defaulted) channel index.
    pub channel: ChannelIndex,

    /// True when `channel` is the configured default rather than a
    /// value read from the event.
    pub inferred: bool,
}

/// Resolves a routing channel from a raw event.
///
/// Pure and infallible: any event shape, including garbage, resolves
/// to either an extracted index or the default with `inferred = true`.
#[derive(Debug, Clone, Copy)]
pub struct ChannelExtractor {
    default_channel: ChannelIndex,
}

impl ChannelExtractor {
    pub fn new(default_channel: ChannelIndex) -> Self {
        Self { default_channel }
    }

    /// The channel used when no strategy matches.
    pub fn default_channel(&self) -> ChannelIndex {
        self.default_channel
    }

    /// Tries every strategy in order; falls back to the default.
    pub fn resolve(&self, event: &Value) -> ChannelResolution {
        for strategy in ChannelStrategy::ORDER {
            if let Some(channel) = strategy.probe(event) {
                return ChannelResolution {
                    channel,
                    inferred: false,
                };
            }
        }
        ChannelResolution {
            channel: self.default_channel,
            inferred: true,
        }
    }
}

impl Default for ChannelExtractor {
    fn default() -> Self {
        Self::new(0)
    }
}
