//! Mesh broker daemon - node session and JSONL fan-out server
//!
//! This binary connects to a mesh-radio node, normalizes its event
//! feed, and relays it to any number of TCP subscribers as
//! newline-delimited JSON, with heartbeats in between.
//!
//! # Usage
//!
//! ```bash
//! # Relay node 192.168.1.201, listen on 127.0.0.1:8765
//! meshbrokerd --host 192.168.1.201 --bind 127.0.0.1 --port 8765
//!
//! # Log every received packet
//! meshbrokerd --host 192.168.1.201 --verbose
//!
//! # Configure via environment
//! MESH_NODE_HOST=10.0.0.7 MESH_BROKER_PORT=9000 meshbrokerd
//!
//! # Enable debug logging selectively
//! RUST_LOG=meshbrokerd=debug meshbrokerd
//! ```
//!
//! # Signal Handling
//!
//! SIGTERM/SIGINT trigger a graceful shutdown: the accept loop stops,
//! the upstream connection closes, and subscriber sockets are closed
//! within a short grace period.

use std::env;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mesh_protocol::ChannelExtractor;
use meshbrokerd::broadcast::{event_channel, Broadcaster};
use meshbrokerd::heartbeat::{HeartbeatEmitter, HEARTBEAT_INTERVAL};
use meshbrokerd::monitor::spawn_resource_monitor;
use meshbrokerd::server::{BrokerServer, SubscriberRegistry, MAX_SUBSCRIBERS};
use meshbrokerd::stats::StatsCollector;
use meshbrokerd::upstream::{SessionStatus, UpstreamSession, DEFAULT_NODE_PORT};

/// Fallback node address when neither flag nor environment sets one.
const DEFAULT_NODE_HOST: &str = "192.168.1.201";

/// Fallback bind address for the fan-out listener.
const DEFAULT_BIND_ADDR: &str = "127.0.0.1";

/// Fallback listen port for the fan-out listener.
const DEFAULT_BROKER_PORT: u16 = 8765;

/// Time allowed for subscriber write loops to wind down after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

/// Mesh broker daemon - JSONL relay for a mesh-radio node
#[derive(Parser, Debug)]
#[command(name = "meshbrokerd", version, about)]
struct Args {
    /// Address of the mesh node (host or host:port)
    #[arg(long)]
    host: Option<String>,

    /// Local address to bind the fan-out listener on
    #[arg(long)]
    bind: Option<String>,

    /// TCP port of the fan-out listener
    #[arg(long)]
    port: Option<u16>,

    /// Channel assigned to events that carry none
    #[arg(long, default_value_t = 0)]
    default_channel: u32,

    /// Log every received packet and connection event
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Node address with the feed port appended when missing.
    fn node_addr(&self) -> String {
        let host = self
            .host
            .clone()
            .or_else(|| env::var("MESH_NODE_HOST").ok())
            .unwrap_or_else(|| DEFAULT_NODE_HOST.to_string());

        if host.contains(':') {
            host
        } else {
            format!("{host}:{DEFAULT_NODE_PORT}")
        }
    }

    fn bind_addr(&self) -> String {
        let bind = self
            .bind
            .clone()
            .or_else(|| env::var("MESH_BIND_ADDR").ok())
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());

        let port = self
            .port
            .or_else(|| {
                env::var("MESH_BROKER_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
            })
            .unwrap_or(DEFAULT_BROKER_PORT);

        format!("{bind}:{port}")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("meshbrokerd={level}").parse()?)
                .add_directive(format!("mesh_protocol={level}").parse()?)
                .add_directive(format!("mesh_core={level}").parse()?),
        )
        .init();

    let node_addr = args.node_addr();
    let bind_addr = args.bind_addr();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        node = %node_addr,
        bind = %bind_addr,
        "Mesh broker starting"
    );

    let cancel = CancellationToken::new();

    let shutdown_token = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    // The owned context: every component gets its handles here, at
    // startup - no globals anywhere in the pipeline.
    let stats = StatsCollector::new();
    let registry = SubscriberRegistry::new(MAX_SUBSCRIBERS);
    let status = SessionStatus::new();
    let (event_tx, event_rx) = event_channel();

    let session = UpstreamSession::new(
        node_addr.clone(),
        ChannelExtractor::new(args.default_channel),
        stats.clone(),
        event_tx.clone(),
        status.clone(),
        cancel.clone(),
    );
    tokio::spawn(session.run());
    info!("Upstream session started");

    let broadcaster = Broadcaster::new(event_rx, registry.clone(), stats.clone(), cancel.clone());
    tokio::spawn(broadcaster.run());

    let heartbeat = HeartbeatEmitter::new(
        node_addr,
        HEARTBEAT_INTERVAL,
        status,
        stats,
        registry.clone(),
        event_tx,
        cancel.clone(),
    );
    tokio::spawn(heartbeat.run());

    let _monitor_handle = spawn_resource_monitor(cancel.clone());

    let server = BrokerServer::new(bind_addr, registry, cancel.clone());
    if let Err(e) = server.run().await {
        // Bind failures land here and are fatal at startup.
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    // Let subscriber write loops observe the cancellation.
    cancel.cancel();
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    info!("Mesh broker stopped");
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
