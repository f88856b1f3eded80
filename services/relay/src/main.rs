//! tcprelay
//!
//! Forwards every TCP connection accepted on the listen address to a fixed
//! upstream destination, relaying bytes in both directions until either
//! side finishes or fails.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tcprelay::config::{DEFAULT_BUFFER_SIZE, DEFAULT_CONNECT_TIMEOUT, DEFAULT_EVENT_CAPACITY};
use tcprelay::executor::{DEFAULT_MAX_IO_THREADS, DEFAULT_WORKER_THREADS};
use tcprelay::sniff::DEFAULT_PREVIEW_BYTES;
use tcprelay::{LoggingSnifferFactory, ProxyConfig, ProxyServer, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Parser)]
#[command(name = "tcprelay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to accept clients on.
    #[arg(long, env = "RELAY_LISTEN_ADDR", default_value = "127.0.0.1:7000")]
    listen: SocketAddr,

    /// Upstream destination (host:port).
    #[arg(long, env = "RELAY_FORWARD_TO")]
    forward_to: String,

    /// Transfer buffer size per direction, in bytes.
    #[arg(long, env = "RELAY_BUFFER_SIZE", default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Upstream connect timeout, in milliseconds.
    #[arg(
        long,
        env = "RELAY_CONNECT_TIMEOUT_MS",
        default_value_t = DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
    )]
    connect_timeout_ms: u64,

    /// Async worker threads in the I/O pool.
    #[arg(long, env = "RELAY_WORKER_THREADS", default_value_t = DEFAULT_WORKER_THREADS)]
    worker_threads: usize,

    /// Upper bound on threads performing socket I/O.
    #[arg(long, default_value_t = DEFAULT_MAX_IO_THREADS)]
    max_io_threads: usize,

    /// Readiness events fetched per selector pass.
    #[arg(long, default_value_t = DEFAULT_EVENT_CAPACITY)]
    event_capacity: usize,

    /// Log a hex preview of upstream traffic at TRACE level.
    #[arg(long)]
    sniff: bool,

    /// Bytes of each upstream chunk shown in the sniff preview.
    #[arg(long, default_value_t = DEFAULT_PREVIEW_BYTES)]
    sniff_preview_bytes: usize,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format.
    #[arg(long, env = "RELAY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

impl Args {
    fn proxy_config(&self) -> ProxyConfig {
        let mut config = ProxyConfig::new(self.listen, self.forward_to.clone())
            .with_buffer_size(self.buffer_size)
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms));
        config.event_capacity = self.event_capacity;
        config
    }
}

fn init_tracing(args: &Args) {
    // Prefer RUST_LOG, fall back to --log-level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    match args.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let config = args.proxy_config();
    config.validate().context("invalid relay configuration")?;

    info!("Starting tcprelay");
    info!(
        listen_addr = %config.listen_addr,
        forward_to = %config.forward_to,
        buffer_size = config.buffer_size,
        connect_timeout_ms = args.connect_timeout_ms,
        worker_threads = args.worker_threads,
        sniff = args.sniff,
        "Configuration loaded"
    );

    let pool = Arc::new(
        WorkerPool::new(args.worker_threads, args.max_io_threads)
            .context("failed to build worker pool")?,
    );

    let mut server = ProxyServer::new(config, pool.clone());
    if args.sniff {
        let factory = LoggingSnifferFactory::with_preview_bytes(args.sniff_preview_bytes);
        server = server.with_sniffer_factory(Arc::new(factory));
    }
    let relay = server.spawn().context("failed to start relay")?;
    info!(bind_addr = %relay.local_addr(), "Relay ready");

    pool.block_on(tokio::signal::ctrl_c())
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    let stats = relay.stats().snapshot();
    relay.shutdown().context("relay did not stop cleanly")?;
    info!(
        accepted = stats.connections_accepted,
        closed = stats.connections_closed,
        connect_failures = stats.connect_failures,
        connect_timeouts = stats.connect_timeouts,
        bytes_to_upstream = stats.bytes_to_upstream,
        bytes_from_upstream = stats.bytes_from_upstream,
        "Relay stopped"
    );
    Ok(())
}
