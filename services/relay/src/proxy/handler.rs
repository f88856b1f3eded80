//! Per-direction event handler.
//!
//! Each relayed connection has two [`ProxyBufferTransferHandler`]s, one per
//! socket. A handler reads its socket into its *input* buffer and drains
//! its *output* buffer into the socket. The reactor thread only decides
//! what to do; the read/write syscalls run on the executor.
//!
//! Backpressure lives entirely in the interest ops:
//!
//! - READ is withdrawn as soon as a read is dispatched. The input buffer's
//!   room-available listener re-arms it.
//! - WRITE is withdrawn as soon as a write is dispatched. The output
//!   buffer's data-available listener re-arms it.
//!
//! Listeners never touch the selector; they queue an [`InterestRequest`]
//! for the reactor thread.

use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use mio::event::Event;
use tracing::{debug, info, trace};

use super::connection::{CloseReason, Connection, Side};
use crate::buffer::Transfer;
use crate::reactor::{EventHandler, InterestRequest, Ops, ReactorContext};
use crate::sniff::SnifferFactory;

/// Lifecycle of one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Built, not registered yet.
    Initial,
    /// Registered; the upstream connect is in progress.
    Connecting,
    /// The socket is connected and relaying.
    Connected,
    /// The connection was torn down.
    Closed,
}

pub struct ProxyBufferTransferHandler {
    side: Side,
    state: HandlerState,
    connection: Arc<Connection>,
    sniffer_factory: Option<Arc<dyn SnifferFactory>>,
}

impl ProxyBufferTransferHandler {
    pub fn new(
        side: Side,
        connection: Arc<Connection>,
        sniffer_factory: Option<Arc<dyn SnifferFactory>>,
    ) -> Self {
        Self {
            side,
            state: HandlerState::Initial,
            connection,
            sniffer_factory,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    /// Register the socket and wire the buffer listeners to this key.
    ///
    /// The upstream socket waits for READ|CONNECT. The accepted client
    /// socket is already connected and only waits for READ.
    pub fn initial_interest_registration(
        mut self,
        cx: &mut ReactorContext<'_>,
    ) -> io::Result<()> {
        let token = self.connection.token(self.side);
        let queue = cx.queue().clone();

        self.connection
            .output(self.side)
            .set_data_listener(Arc::new(InterestRequest::write(queue.clone(), token)));
        self.connection
            .input(self.side)
            .set_room_listener(Arc::new(InterestRequest::read(queue, token)));

        let ops = match self.side {
            Side::Client => {
                self.state = HandlerState::Connected;
                Ops::READ
            }
            Side::Upstream => {
                self.state = HandlerState::Connecting;
                Ops::READ | Ops::CONNECT
            }
        };

        let fd = self.connection.channel(self.side).as_raw_fd();
        cx.register(token, fd, ops, Box::new(self))
    }

    /// Check whether a non-blocking connect has completed.
    fn finish_connect(&self) -> io::Result<bool> {
        let channel = self.connection.channel(self.side);
        if let Some(err) = channel.take_error()? {
            return Err(err);
        }
        match channel.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn on_connected(&mut self, cx: &mut ReactorContext<'_>) -> io::Result<()> {
        let token = self.connection.token(self.side);
        cx.disable(token, Ops::CONNECT)?;
        self.state = HandlerState::Connected;

        if !self.connection.connected(cx) && self.connection.is_closed() {
            // The connect deadline won; the close already ran.
            return Ok(());
        }

        let channel = self.connection.channel(self.side);
        info!(
            peer = ?self.connection.peer(),
            upstream = ?channel.peer_addr().ok(),
            token = token.0,
            "Upstream connected"
        );

        if let Some(factory) = &self.sniffer_factory {
            self.connection
                .input(self.side)
                .set_sniffer(factory.create(channel));
            debug!(token = token.0, "Sniffer attached");
        }
        Ok(())
    }

    fn handle(&mut self, cx: &mut ReactorContext<'_>, event: &Event) -> io::Result<()> {
        let token = self.connection.token(self.side);

        if self.state == HandlerState::Connecting {
            if !self.finish_connect()? {
                return Ok(());
            }
            self.on_connected(cx)?;
        }
        if self.connection.is_closed() {
            self.state = HandlerState::Closed;
            return Ok(());
        }

        let Some(ops) = cx.interest(token) else {
            return Ok(());
        };

        let readable = event.is_readable() || event.is_read_closed() || event.is_error();
        if readable && ops.contains(Ops::READ) {
            cx.disable(token, Ops::READ)?;
            self.dispatch_read(cx);
        }

        let writable = event.is_writable() || event.is_write_closed() || event.is_error();
        if writable && ops.contains(Ops::WRITE) {
            cx.disable(token, Ops::WRITE)?;
            self.dispatch_write(cx);
        }
        Ok(())
    }

    /// Hand a single read of the socket into the input buffer to a worker.
    fn dispatch_read(&self, cx: &mut ReactorContext<'_>) {
        let side = self.side;
        let connection = Arc::clone(&self.connection);
        let queue = cx.queue().clone();

        cx.executor().execute(Box::new(move || {
            let token = connection.token(side).0;
            match connection.input(side).read(&**connection.channel(side)) {
                Ok(Transfer::Bytes(n)) => trace!(side = %side, token, bytes = n, "Read"),
                Ok(Transfer::Eof) => debug!(side = %side, token, "End of stream"),
                Err(e) => {
                    debug!(side = %side, token, error = %e, "Read failed");
                    connection.request_close(&queue, CloseReason::Io);
                }
            }
        }));
    }

    /// Hand a single drain of the output buffer into the socket to a worker.
    fn dispatch_write(&self, cx: &mut ReactorContext<'_>) {
        let side = self.side;
        let connection = Arc::clone(&self.connection);
        let queue = cx.queue().clone();

        cx.executor().execute(Box::new(move || {
            let token = connection.token(side).0;
            let output = connection.output(side);
            match output.write(&**connection.channel(side)) {
                Ok(n) => {
                    trace!(side = %side, token, bytes = n, "Wrote");
                    let counter = match side {
                        Side::Client => &connection.stats().bytes_from_upstream,
                        Side::Upstream => &connection.stats().bytes_to_upstream,
                    };
                    counter.fetch_add(n as u64, Ordering::Relaxed);

                    if output.is_output_shutdown() && connection.both_finished() {
                        connection.request_close(&queue, CloseReason::Finished);
                    }
                }
                Err(e) => {
                    debug!(side = %side, token, error = %e, "Write failed");
                    connection.request_close(&queue, CloseReason::Io);
                }
            }
        }));
    }
}

impl EventHandler for ProxyBufferTransferHandler {
    fn can_run_async(&self) -> bool {
        true
    }

    fn run(&mut self, cx: &mut ReactorContext<'_>, event: &Event) -> io::Result<()> {
        self.run_async(cx, event)
    }

    fn run_async(&mut self, cx: &mut ReactorContext<'_>, event: &Event) -> io::Result<()> {
        let result = self.handle(cx, event);
        if let Err(e) = &result {
            let reason = match self.state {
                HandlerState::Initial | HandlerState::Connecting => CloseReason::ConnectFailed,
                HandlerState::Connected | HandlerState::Closed => CloseReason::Io,
            };
            debug!(side = %self.side, error = %e, "Handler failed");
            self.connection.close(cx, reason);
            self.state = HandlerState::Closed;
        }
        result
    }

    fn close(&mut self, cx: &mut ReactorContext<'_>) {
        self.connection.close(cx, CloseReason::Shutdown);
        self.state = HandlerState::Closed;
    }
}
