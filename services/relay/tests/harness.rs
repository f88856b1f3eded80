//! Test harness for relay integration tests.
//!
//! Loopback upstreams (echo, flood, and one that never completes a
//! handshake) plus a relay spawned in front of them.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;

use tcprelay::{Executor, ProxyConfig, ProxyHandle, ProxyServer, SnifferFactory};

/// Flood writes are whole chunks, so byte `i` of the stream is `i as u8`.
pub const FLOOD_CHUNK: usize = 4096;

#[derive(Clone, Default)]
struct Counters {
    accepted: Arc<AtomicU64>,
    received: Arc<AtomicU64>,
    sent: Arc<AtomicU64>,
}

/// A loopback upstream serving every accepted connection with one
/// behaviour. Stops accepting when dropped.
pub struct Upstream {
    pub addr: SocketAddr,
    counters: Counters,
    acceptor: JoinHandle<()>,
}

#[allow(dead_code)]
impl Upstream {
    async fn serve<F, Fut>(serve: F) -> Self
    where
        F: Fn(TcpStream, Counters) -> Fut + Send + 'static,
        Fut: Future<Output = io::Result<()>> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let counters = Counters::default();

        let shared = counters.clone();
        let acceptor = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                shared.accepted.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(serve(stream, shared.clone()));
            }
        });

        Self {
            addr,
            counters,
            acceptor,
        }
    }

    /// Echo every byte; half-close once the relay half-closes.
    pub async fn echo() -> Self {
        Self::serve(|mut stream, counters| async move {
            let mut buf = vec![0u8; 8192];
            loop {
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                counters.received.fetch_add(n as u64, Ordering::Relaxed);
                stream.write_all(&buf[..n]).await?;
                counters.sent.fetch_add(n as u64, Ordering::Relaxed);
            }
            stream.shutdown().await
        })
        .await
    }

    /// Write [`FLOOD_CHUNK`]-sized chunks as fast as the relay takes them
    /// until `stop` is set, then half-close.
    pub async fn flood(stop: Arc<AtomicBool>) -> Self {
        Self::serve(move |mut stream, counters| {
            let stop = Arc::clone(&stop);
            async move {
                let chunk: Vec<u8> = (0..FLOOD_CHUNK).map(|i| i as u8).collect();
                while !stop.load(Ordering::Relaxed) {
                    stream.write_all(&chunk).await?;
                    counters.sent.fetch_add(FLOOD_CHUNK as u64, Ordering::Relaxed);
                }
                stream.shutdown().await
            }
        })
        .await
    }

    pub fn accepted(&self) -> u64 {
        self.counters.accepted.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.counters.received.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> u64 {
        self.counters.sent.load(Ordering::Relaxed)
    }
}

impl Drop for Upstream {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

/// A loopback listener that never accepts and whose accept queue is full,
/// so the kernel drops further SYNs and a new connect stays pending.
#[allow(dead_code)]
pub struct StalledUpstream {
    pub addr: SocketAddr,
    _listener: TcpListener,
    _queued: Vec<TcpStream>,
}

#[allow(dead_code)]
impl StalledUpstream {
    pub async fn bind() -> Self {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(1).unwrap();
        let addr = listener.local_addr().unwrap();

        // Fill the queue until a handshake no longer completes.
        let mut queued = Vec::new();
        for _ in 0..64 {
            match tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await
            {
                Ok(Ok(stream)) => queued.push(stream),
                Ok(Err(e)) => panic!("connect to stalled upstream failed: {e}"),
                Err(_) => {
                    return Self {
                        addr,
                        _listener: listener,
                        _queued: queued,
                    }
                }
            }
        }
        panic!("accept queue of {addr} never filled");
    }
}

/// Options for a test relay.
#[derive(Clone)]
pub struct RelayOptions {
    pub buffer_size: usize,
    pub connect_timeout: Duration,
    pub sniffer_factory: Option<Arc<dyn SnifferFactory>>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            buffer_size: 16 * 1024,
            connect_timeout: Duration::from_secs(2),
            sniffer_factory: None,
        }
    }
}

/// Start a relay on an ephemeral loopback port forwarding to `upstream`.
///
/// Socket I/O runs on the blocking pool of the test's runtime.
pub fn spawn_relay(upstream: SocketAddr, options: RelayOptions) -> ProxyHandle {
    let executor: Arc<dyn Executor> = Arc::new(tokio::runtime::Handle::current());
    let config = ProxyConfig::new("127.0.0.1:0".parse().unwrap(), upstream.to_string())
        .with_buffer_size(options.buffer_size)
        .with_connect_timeout(options.connect_timeout);

    let mut server = ProxyServer::new(config, executor);
    if let Some(factory) = options.sniffer_factory {
        server = server.with_sniffer_factory(factory);
    }
    server.spawn().unwrap()
}

/// Live keys on the relay's reactor, counted on the reactor thread.
#[allow(dead_code)]
pub async fn key_count(relay: &ProxyHandle) -> usize {
    let (tx, rx) = tokio::sync::oneshot::channel();
    relay.reactor().submit(move |cx| {
        let _ = tx.send(cx.key_count());
    });
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap()
}

/// An address nothing listens on.
#[allow(dead_code)]
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Read exactly `len` bytes.
#[allow(dead_code)]
pub async fn read_n(stream: &mut TcpStream, len: usize) -> io::Result<Vec<u8>> {
    let mut out = vec![0u8; len];
    stream.read_exact(&mut out).await?;
    Ok(out)
}

/// Poll `check` until it holds or `within` elapses.
#[allow(dead_code)]
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let stop = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < stop {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
