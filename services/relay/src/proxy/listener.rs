//! Accept loop for the relay.

use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use mio::event::Event;
use mio::net::TcpListener;
use mio::Token;
use tracing::{debug, error, info, warn};

use super::client::ProxyClientHandler;
use super::stats::RelayStats;
use crate::reactor::{EventHandler, Ops, ReactorContext};

/// Accepts clients on the reactor thread and hands each one to a
/// [`ProxyClientHandler`].
pub struct ProxyListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    client_handler: ProxyClientHandler,
    stats: Arc<RelayStats>,
}

impl ProxyListener {
    pub fn new(
        listener: TcpListener,
        client_handler: ProxyClientHandler,
        stats: Arc<RelayStats>,
    ) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            client_handler,
            stats,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register for READ on the reactor.
    pub fn register(self, cx: &mut ReactorContext<'_>) -> io::Result<Token> {
        let token = cx.next_token();
        let local_addr = self.local_addr;
        let destination = self.client_handler.fwd_destination();
        let fd = self.listener.as_raw_fd();
        cx.register(token, fd, Ops::READ, Box::new(self))?;
        info!(
            bind_addr = %local_addr,
            destination = %destination,
            token = token.0,
            "Listener registered"
        );
        Ok(token)
    }
}

impl EventHandler for ProxyListener {
    fn run(&mut self, cx: &mut ReactorContext<'_>, _event: &Event) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(peer = %peer, "Connection accepted");

                    if let Err(e) = self.client_handler.handle(cx, stream) {
                        warn!(peer = %peer, error = %e, "Failed to set up relay");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Stay registered; the next connection raises a new edge.
                    error!(bind_addr = %self.local_addr, error = %e, "Accept error");
                    return Ok(());
                }
            }
        }
    }

    fn close(&mut self, _cx: &mut ReactorContext<'_>) {
        info!(bind_addr = %self.local_addr, "Listener closed");
    }
}
