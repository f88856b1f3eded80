//! One client↔upstream relay instance.

use std::fmt;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mio::net::TcpStream;
use mio::Token;
use parking_lot::Mutex;
use tracing::{info, trace, warn};

use super::stats::RelayStats;
use crate::buffer::TransferBuffer;
use crate::reactor::{DeadlineRef, ReactorContext, SelectorQueue};

/// Which socket of a connection a handler owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Upstream,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Upstream => "upstream",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Both directions completed their half-close.
    Finished,
    /// The upstream connect failed.
    ConnectFailed,
    /// The upstream connect did not complete before the deadline.
    ConnectTimeout,
    /// A read or write failed on either socket.
    Io,
    /// The reactor is shutting down.
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Finished => "finished",
            CloseReason::ConnectFailed => "connect_failed",
            CloseReason::ConnectTimeout => "connect_timeout",
            CloseReason::Io => "io_error",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sockets, buffers and lifecycle state shared by the two directional
/// handlers of a relayed connection.
///
/// `c2s` is filled from the client and drained into upstream; `s2c` the
/// reverse. The connection exclusively owns both sockets until [`close`]
/// runs, which happens once no matter how many paths race to it.
///
/// [`close`]: Connection::close
pub struct Connection {
    client: Arc<TcpStream>,
    upstream: Arc<TcpStream>,
    c2s: Arc<TransferBuffer>,
    s2c: Arc<TransferBuffer>,
    client_token: Token,
    upstream_token: Token,
    peer: Option<SocketAddr>,
    closed: AtomicBool,
    connect_deadline: Mutex<Option<DeadlineRef>>,
    stats: Arc<RelayStats>,
}

impl Connection {
    pub(crate) fn new(
        client: TcpStream,
        upstream: TcpStream,
        buffer_size: usize,
        client_token: Token,
        upstream_token: Token,
        stats: Arc<RelayStats>,
    ) -> Self {
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        Self {
            peer: client.peer_addr().ok(),
            client: Arc::new(client),
            upstream: Arc::new(upstream),
            c2s: Arc::new(TransferBuffer::new(buffer_size)),
            s2c: Arc::new(TransferBuffer::new(buffer_size)),
            client_token,
            upstream_token,
            closed: AtomicBool::new(false),
            connect_deadline: Mutex::new(None),
            stats,
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn token(&self, side: Side) -> Token {
        match side {
            Side::Client => self.client_token,
            Side::Upstream => self.upstream_token,
        }
    }

    pub(crate) fn channel(&self, side: Side) -> &Arc<TcpStream> {
        match side {
            Side::Client => &self.client,
            Side::Upstream => &self.upstream,
        }
    }

    /// Buffer filled from `side`'s socket.
    pub(crate) fn input(&self, side: Side) -> &Arc<TransferBuffer> {
        match side {
            Side::Client => &self.c2s,
            Side::Upstream => &self.s2c,
        }
    }

    /// Buffer drained into `side`'s socket.
    pub(crate) fn output(&self, side: Side) -> &Arc<TransferBuffer> {
        match side {
            Side::Client => &self.s2c,
            Side::Upstream => &self.c2s,
        }
    }

    pub(crate) fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Both directions have shut down their output.
    pub fn both_finished(&self) -> bool {
        self.c2s.is_output_shutdown() && self.s2c.is_output_shutdown()
    }

    /// Remember the connect-timeout action so either completion path can
    /// cancel it.
    pub(crate) fn arm_connect_deadline(&self, deadline: DeadlineRef) {
        *self.connect_deadline.lock() = Some(deadline);
    }

    /// Upstream connect completed: cancel the connect deadline.
    ///
    /// Returns `true` if the timeout was still pending. `false` means it
    /// already fired (and closed the connection) or was cancelled before.
    pub fn connected(&self, cx: &mut ReactorContext<'_>) -> bool {
        match self.connect_deadline.lock().take() {
            Some(deadline) => cx.deadlines().cancel(deadline),
            None => false,
        }
    }

    /// Tear the connection down. Returns `false` if it was already closed.
    pub fn close(&self, cx: &mut ReactorContext<'_>, reason: CloseReason) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        if let Some(deadline) = self.connect_deadline.lock().take() {
            cx.deadlines().cancel(deadline);
        }
        cx.cancel(self.client_token);
        cx.cancel(self.upstream_token);
        for (side, stream) in [(Side::Client, &self.client), (Side::Upstream, &self.upstream)] {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                trace!(side = %side, error = %e, "Shutdown on close failed");
            }
        }

        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
        match reason {
            CloseReason::ConnectTimeout => {
                self.stats.connect_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    peer = ?self.peer,
                    token = self.upstream_token.0,
                    "Upstream connect timed out"
                );
            }
            CloseReason::ConnectFailed => {
                self.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    peer = ?self.peer,
                    token = self.upstream_token.0,
                    "Upstream connect failed"
                );
            }
            _ => {}
        }

        info!(
            peer = ?self.peer,
            reason = %reason,
            bytes_to_upstream = self.c2s.bytes_written(),
            bytes_from_upstream = self.s2c.bytes_written(),
            "Connection closed"
        );
        true
    }

    /// Close from a worker thread: hand the close to the reactor.
    pub fn request_close(self: &Arc<Self>, queue: &SelectorQueue, reason: CloseReason) {
        if self.is_closed() {
            return;
        }
        let connection = Arc::clone(self);
        queue.submit(move |cx| {
            connection.close(cx, reason);
        });
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("client_token", &self.client_token)
            .field("upstream_token", &self.upstream_token)
            .field("c2s", &self.c2s)
            .field("s2c", &self.s2c)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::{TcpListener as StdListener, TcpStream as StdStream};
    use std::time::{Duration, Instant};

    use crate::executor::InlineExecutor;
    use crate::reactor::Reactor;

    fn socket_pair() -> (TcpStream, StdStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let peer = StdStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        (TcpStream::from_std(accepted), peer)
    }

    struct Fixture {
        reactor: Reactor,
        connection: Arc<Connection>,
        stats: Arc<RelayStats>,
        client_peer: StdStream,
        upstream_peer: StdStream,
    }

    /// A connection whose connect deadline closes it with `ConnectTimeout`.
    fn fixture() -> Fixture {
        let mut reactor = Reactor::new(Arc::new(InlineExecutor)).unwrap();
        let stats = Arc::new(RelayStats::new());
        let (client, client_peer) = socket_pair();
        let (upstream, upstream_peer) = socket_pair();

        let connection = reactor.with_context(|cx| {
            let client_token = cx.next_token();
            let upstream_token = cx.next_token();
            let connection = Arc::new(Connection::new(
                client,
                upstream,
                64,
                client_token,
                upstream_token,
                Arc::clone(&stats),
            ));
            let on_timeout = Arc::clone(&connection);
            let deadline = cx
                .deadlines()
                .schedule_after(Duration::from_millis(5), move |cx| {
                    on_timeout.close(cx, CloseReason::ConnectTimeout);
                });
            connection.arm_connect_deadline(deadline);
            connection
        });

        Fixture {
            reactor,
            connection,
            stats,
            client_peer,
            upstream_peer,
        }
    }

    fn fire_due(reactor: &mut Reactor) -> usize {
        reactor.with_context(|cx| {
            let due = cx.deadlines().expire(Instant::now() + Duration::from_secs(60));
            let count = due.len();
            for action in due {
                action.fire(cx);
            }
            count
        })
    }

    fn assert_peer_closed(peer: &mut StdStream) {
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 8];
        // Orderly EOF or reset; either way the relay side is gone.
        match peer.read(&mut buf) {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert_ne!(e.kind(), std::io::ErrorKind::WouldBlock),
        }
    }

    #[test]
    fn test_connect_wins_race() {
        let mut f = fixture();

        let cancelled = f.reactor.with_context(|cx| f.connection.connected(cx));
        assert!(cancelled);
        assert_eq!(fire_due(&mut f.reactor), 0);
        assert!(!f.connection.is_closed());

        // A second completion path finds nothing left to cancel.
        assert!(!f.reactor.with_context(|cx| f.connection.connected(cx)));

        assert!(f
            .reactor
            .with_context(|cx| f.connection.close(cx, CloseReason::Finished)));
        assert!(!f
            .reactor
            .with_context(|cx| f.connection.close(cx, CloseReason::Io)));

        let stats = f.stats.snapshot();
        assert_eq!(stats.connect_timeouts, 0);
        assert_eq!(stats.connections_closed, 1);
        assert_eq!(stats.connections_active, 0);
        assert_peer_closed(&mut f.client_peer);
        assert_peer_closed(&mut f.upstream_peer);
    }

    #[test]
    fn test_timeout_wins_race() {
        let mut f = fixture();

        assert_eq!(fire_due(&mut f.reactor), 1);
        assert!(f.connection.is_closed());

        // Connect completes just after: cancel is a no-op, close too.
        assert!(!f.reactor.with_context(|cx| f.connection.connected(cx)));
        assert!(!f
            .reactor
            .with_context(|cx| f.connection.close(cx, CloseReason::Finished)));

        let stats = f.stats.snapshot();
        assert_eq!(stats.connect_timeouts, 1);
        assert_eq!(stats.connections_closed, 1);
        assert_eq!(stats.connections_active, 0);
        assert_peer_closed(&mut f.client_peer);
        assert_peer_closed(&mut f.upstream_peer);
    }

    #[test]
    fn test_close_cancels_pending_deadline() {
        let mut f = fixture();

        assert!(f
            .reactor
            .with_context(|cx| f.connection.close(cx, CloseReason::Io)));
        assert_eq!(fire_due(&mut f.reactor), 0);
        assert_eq!(f.stats.snapshot().connect_timeouts, 0);
    }

    #[test]
    fn test_buffers_are_mirrored() {
        let f = fixture();
        let conn = &f.connection;
        assert!(Arc::ptr_eq(conn.input(Side::Client), conn.output(Side::Upstream)));
        assert!(Arc::ptr_eq(conn.input(Side::Upstream), conn.output(Side::Client)));
        assert_ne!(conn.token(Side::Client), conn.token(Side::Upstream));
        assert!(!conn.both_finished());
    }
}
