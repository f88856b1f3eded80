//! TCP relay built on the reactor.
//!
//! ## Architecture
//!
//! ```text
//! Client -> ProxyListener -> ProxyClientHandler -> Connection
//!                                                    |
//!                  ProxyBufferTransferHandler(client) | ProxyBufferTransferHandler(upstream)
//!                           reads c2s, writes s2c     |  reads s2c, writes c2s
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let pool = Arc::new(WorkerPool::new(2, 512)?);
//! let config = ProxyConfig::new("127.0.0.1:7000".parse()?, "backend:7001");
//! let handle = ProxyServer::new(config, pool).spawn()?;
//! // ...
//! handle.shutdown()?;
//! ```

mod client;
mod connection;
mod handler;
mod listener;
mod stats;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use mio::net::TcpListener;
use tracing::{info, warn};

pub use client::ProxyClientHandler;
pub use connection::{CloseReason, Connection, Side};
pub use handler::{HandlerState, ProxyBufferTransferHandler};
pub use listener::ProxyListener;
pub use stats::{RelayStats, StatsSnapshot};

use crate::config::ProxyConfig;
use crate::error::{RelayError, Result};
use crate::executor::Executor;
use crate::reactor::{Reactor, ReactorHandle};
use crate::sniff::SnifferFactory;

/// Builder for a running relay.
pub struct ProxyServer {
    config: ProxyConfig,
    executor: Arc<dyn Executor>,
    sniffer_factory: Option<Arc<dyn SnifferFactory>>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig, executor: Arc<dyn Executor>) -> Self {
        Self {
            config,
            executor,
            sniffer_factory: None,
        }
    }

    /// Attach a sniffer to every upstream connection.
    pub fn with_sniffer_factory(mut self, sniffer_factory: Arc<dyn SnifferFactory>) -> Self {
        self.sniffer_factory = Some(sniffer_factory);
        self
    }

    /// Bind the listener and start the reactor thread.
    pub fn spawn(self) -> Result<ProxyHandle> {
        let destination = self.config.resolve_destination()?;

        let listener = TcpListener::bind(self.config.listen_addr)?;
        let stats = Arc::new(RelayStats::new());

        let mut client_handler = ProxyClientHandler::new(destination, Arc::clone(&stats))
            .with_buffer_size(self.config.buffer_size)
            .with_connect_timeout(self.config.connect_timeout);
        if let Some(factory) = self.sniffer_factory {
            client_handler = client_handler.with_sniffer_factory(factory);
        }

        let listener = ProxyListener::new(listener, client_handler, Arc::clone(&stats))?;
        let local_addr = listener.local_addr();

        let mut reactor = Reactor::with_event_capacity(self.executor, self.config.event_capacity)?;
        reactor.with_context(|cx| listener.register(cx))?;
        let reactor_handle = reactor.handle();
        let thread = reactor.spawn()?;

        info!(
            bind_addr = %local_addr,
            destination = %destination,
            buffer_size = self.config.buffer_size,
            connect_timeout_ms = self.config.connect_timeout.as_millis() as u64,
            "Relay started"
        );

        Ok(ProxyHandle {
            local_addr,
            stats,
            reactor: reactor_handle,
            thread: Some(thread),
        })
    }
}

impl fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyServer")
            .field("config", &self.config)
            .field("sniffing", &self.sniffer_factory.is_some())
            .finish_non_exhaustive()
    }
}

/// A running relay. Dropping the handle stops it.
pub struct ProxyHandle {
    local_addr: SocketAddr,
    stats: Arc<RelayStats>,
    reactor: ReactorHandle,
    thread: Option<JoinHandle<std::io::Result<()>>>,
}

impl ProxyHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn reactor(&self) -> &ReactorHandle {
        &self.reactor
    }

    /// Stop the reactor, closing every connection, and wait for it.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.reactor.shutdown();
        match thread.join() {
            Ok(result) => result.map_err(RelayError::from),
            Err(_) => Err(RelayError::ReactorPanicked),
        }
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, reason = e.reason_code(), "Relay stopped with error");
        }
    }
}

impl fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("local_addr", &self.local_addr)
            .field("stats", &self.stats.snapshot())
            .field("running", &self.thread.is_some())
            .finish()
    }
}
