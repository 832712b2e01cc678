//! Normalized packet model.
//!
//! Upstream events arrive in whatever shape the node firmware produced;
//! the broker reduces every one of them to a [`NormalizedPacket`] before
//! anything downstream sees it. The serialized field names here are the
//! wire contract consumed by probes and bots - changes must be additive.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Integer routing lane used by the mesh protocol to separate
/// logical conversations.
pub type ChannelIndex = u32;

/// Identifier of a mesh node, e.g. `!a1b2c3d4`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the broadcast pseudo-address (`^all` or empty).
    pub fn is_broadcast(&self) -> bool {
        self.0.is_empty() || self.0 == "^all"
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Application-level message-type identifier carried by a packet.
///
/// Kept as an open string rather than a closed enum: firmware revisions
/// add portnums faster than we want to release.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Portnum(String);

impl Portnum {
    /// Portnum of plain text messages.
    pub const TEXT_MESSAGE: &'static str = "TEXT_MESSAGE_APP";

    /// Portnum assigned to events whose payload could not be decoded
    /// (encrypted traffic, unknown firmware shapes).
    pub const UNKNOWN: &'static str = "UNKNOWN";

    pub fn new(port: impl Into<String>) -> Self {
        Self(port.into())
    }

    /// The sentinel portnum for undecodable payloads.
    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if this packet carries a user-visible text body.
    pub fn is_text_message(&self) -> bool {
        self.0 == Self::TEXT_MESSAGE
    }
}

impl fmt::Display for Portnum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Portnum {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A fully normalized inbound packet.
///
/// Invariant: `channel` is always resolved to an integer. When the
/// event carried no usable channel field the configured default is used
/// and `channel_inferred` is set - the channel is never silently absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedPacket {
    /// Routing channel, resolved or defaulted.
    pub channel: ChannelIndex,

    /// True when `channel` came from the configured default rather
    /// than the event itself.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub channel_inferred: bool,

    /// Application message type.
    pub portnum: Portnum,

    /// Sender node id.
    pub from: NodeId,

    /// Destination node id (broadcast when empty).
    pub to: NodeId,

    /// Received signal strength in dBm, when the radio reported it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,

    /// Signal-to-noise ratio in dB, when the radio reported it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,

    /// Recovered text body, for text-message packets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Unix timestamp (seconds) at which the broker received the event.
    pub timestamp_received: i64,
}

impl NormalizedPacket {
    /// Returns the receive time as a UTC instant, if the stored
    /// timestamp is representable.
    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.timestamp_received, 0).single()
    }
}
