//! Mesh Core - Shared domain types for the mesh broker
//!
//! This crate provides the types shared between the wire protocol
//! (mesh-protocol) and the daemon (meshbrokerd).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod packet;
pub mod stats;

// Re-exports for convenience
pub use packet::{ChannelIndex, NodeId, NormalizedPacket, Portnum};
pub use stats::StatsSnapshot;
