//! Mesh Protocol - Wire protocol and normalization for the mesh broker
//!
//! This crate provides:
//! - `extract` - channel resolution from variable-shaped node events
//! - `event` - normalization of raw events into [`mesh_core::NormalizedPacket`]
//! - `message` - the JSONL line schema broadcast to subscribers

pub mod event;
pub mod extract;
pub mod message;

pub use event::{normalize, Normalized, NormalizeError};
pub use extract::{ChannelExtractor, ChannelResolution, ChannelStrategy};
pub use message::{BrokerMessage, HeartbeatRecord};
