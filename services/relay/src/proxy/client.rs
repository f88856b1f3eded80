//! Wiring of a freshly accepted client connection.

use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpStream;
use tracing::{debug, warn};

use super::connection::{CloseReason, Connection, Side};
use super::handler::ProxyBufferTransferHandler;
use super::stats::RelayStats;
use crate::config::{DEFAULT_BUFFER_SIZE, DEFAULT_CONNECT_TIMEOUT};
use crate::reactor::ReactorContext;
use crate::sniff::SnifferFactory;

/// Opens the upstream side for each accepted client and registers the two
/// directional handlers.
#[derive(Clone)]
pub struct ProxyClientHandler {
    fwd_destination: SocketAddr,
    proxy_buffer_size: usize,
    connect_timeout: Duration,
    sniffer_factory: Option<Arc<dyn SnifferFactory>>,
    stats: Arc<RelayStats>,
}

impl ProxyClientHandler {
    pub fn new(fwd_destination: SocketAddr, stats: Arc<RelayStats>) -> Self {
        Self {
            fwd_destination,
            proxy_buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            sniffer_factory: None,
            stats,
        }
    }

    pub fn with_buffer_size(mut self, proxy_buffer_size: usize) -> Self {
        self.proxy_buffer_size = proxy_buffer_size.max(1);
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_sniffer_factory(mut self, sniffer_factory: Arc<dyn SnifferFactory>) -> Self {
        self.sniffer_factory = Some(sniffer_factory);
        self
    }

    pub fn fwd_destination(&self) -> SocketAddr {
        self.fwd_destination
    }

    /// Start relaying `client` to the forward destination.
    ///
    /// The upstream connect is non-blocking; a deadline closes both sockets
    /// if it has not completed within the connect timeout. A connect that
    /// fails immediately closes the client and is counted as a failure.
    pub fn handle(&self, cx: &mut ReactorContext<'_>, client: TcpStream) -> io::Result<()> {
        let peer = client.peer_addr().ok();
        if let Err(e) = client.set_nodelay(true) {
            debug!(peer = ?peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let upstream = match TcpStream::connect(self.fwd_destination) {
            Ok(upstream) => upstream,
            Err(e) => {
                self.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    peer = ?peer,
                    destination = %self.fwd_destination,
                    error = %e,
                    "Upstream connect failed"
                );
                if let Err(e) = client.shutdown(Shutdown::Both) {
                    debug!(peer = ?peer, error = %e, "Client shutdown failed");
                }
                return Ok(());
            }
        };

        let client_token = cx.next_token();
        let upstream_token = cx.next_token();
        let connection = Arc::new(Connection::new(
            client,
            upstream,
            self.proxy_buffer_size,
            client_token,
            upstream_token,
            Arc::clone(&self.stats),
        ));

        let on_timeout = Arc::clone(&connection);
        let deadline = cx
            .deadlines()
            .schedule_after(self.connect_timeout, move |cx| {
                on_timeout.close(cx, CloseReason::ConnectTimeout);
            });
        connection.arm_connect_deadline(deadline);

        debug!(
            peer = ?peer,
            destination = %self.fwd_destination,
            client_token = client_token.0,
            upstream_token = upstream_token.0,
            "Connecting upstream"
        );

        for side in [Side::Upstream, Side::Client] {
            let handler = ProxyBufferTransferHandler::new(
                side,
                Arc::clone(&connection),
                self.sniffer_factory.clone(),
            );
            if let Err(e) = handler.initial_interest_registration(cx) {
                connection.close(cx, CloseReason::Io);
                return Err(e);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ProxyClientHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyClientHandler")
            .field("fwd_destination", &self.fwd_destination)
            .field("proxy_buffer_size", &self.proxy_buffer_size)
            .field("connect_timeout", &self.connect_timeout)
            .field("sniffing", &self.sniffer_factory.is_some())
            .finish()
    }
}
