//! Mesh broker daemon - upstream session and JSONL fan-out server
//!
//! This crate provides the broker's moving parts:
//! - `upstream` - the single session to the mesh-radio node, with
//!   reconnection and health checking
//! - `broadcast` - the serialized fan-out point for packets and heartbeats
//! - `server` - TCP listener, subscriber registry, per-subscriber write loops
//! - `heartbeat` - periodic liveness/statistics emitter
//! - `stats` - process-lifetime counters
//! - `monitor` - daemon resource-usage monitor
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐   bounded mpsc    ┌─────────────────┐
//! │ UpstreamSession │──────────────────▶│   Broadcaster   │
//! │  (node feed)    │   BrokerEvent     │ (single task,   │
//! └─────────────────┘        ▲          │  ordered)       │
//!                            │          └────────┬────────┘
//! ┌─────────────────┐        │                   │ registry snapshot
//! │ HeartbeatEmitter│────────┘                   ▼
//! └─────────────────┘                   ┌─────────────────┐
//!                                       │ per-subscriber  │
//! ┌─────────────────┐    register       │ queues + write  │
//! │  BrokerServer   │──────────────────▶│ loops           │
//! │  (accept loop)  │                   └─────────────────┘
//! └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod broadcast;
pub mod heartbeat;
pub mod monitor;
pub mod server;
pub mod stats;
pub mod upstream;
