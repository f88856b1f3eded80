//! Traffic sniffing hooks.
//!
//! A [`Sniffer`] sees every chunk that lands in the transfer buffer it is
//! attached to, and every transport error raised on that buffer. It may
//! rewrite bytes in place, truncate the chunk, simulate end of stream, or
//! suppress/replace an error. The relay itself never interprets bytes.
//!
//! Sniffers are created per upstream connection by a [`SnifferFactory`],
//! once the upstream connect has completed, and attached to the buffer
//! carrying upstream→client traffic.

use std::io;
use std::net::SocketAddr;

use mio::net::TcpStream;
use tracing::{debug, trace};

/// Maximum bytes rendered in a hex preview.
pub const DEFAULT_PREVIEW_BYTES: usize = 32;

/// Observer/mutator of bytes and errors flowing through one buffer.
///
/// Called under the buffer lock from whichever worker performs the I/O,
/// so implementations must not block.
pub trait Sniffer: Send {
    /// Inspect a freshly received chunk.
    ///
    /// `chunk` may be modified in place. Returns the number of bytes (from
    /// the front of `chunk`) to keep, or `None` to treat the stream as
    /// ended.
    fn received(&mut self, chunk: &mut [u8]) -> Option<usize>;

    /// Inspect a transport error.
    ///
    /// Returning `None` swallows the error; the operation then reports zero
    /// bytes transferred.
    fn received_error(&mut self, err: io::Error) -> Option<io::Error> {
        Some(err)
    }
}

/// Creates a [`Sniffer`] for each established upstream connection.
pub trait SnifferFactory: Send + Sync {
    fn create(&self, upstream: &TcpStream) -> Box<dyn Sniffer>;
}

/// Factory for sniffers that log traffic received from upstream.
#[derive(Debug, Clone)]
pub struct LoggingSnifferFactory {
    preview_bytes: usize,
}

impl LoggingSnifferFactory {
    pub fn new() -> Self {
        Self {
            preview_bytes: DEFAULT_PREVIEW_BYTES,
        }
    }

    /// Limit the hex preview to `preview_bytes` per chunk.
    pub fn with_preview_bytes(preview_bytes: usize) -> Self {
        Self { preview_bytes }
    }
}

impl Default for LoggingSnifferFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SnifferFactory for LoggingSnifferFactory {
    fn create(&self, upstream: &TcpStream) -> Box<dyn Sniffer> {
        Box::new(LoggingSniffer {
            peer: upstream.peer_addr().ok(),
            preview_bytes: self.preview_bytes,
            total: 0,
        })
    }
}

/// Logs chunk sizes and a hex preview; never alters traffic.
#[derive(Debug)]
pub struct LoggingSniffer {
    peer: Option<SocketAddr>,
    preview_bytes: usize,
    total: u64,
}

impl Sniffer for LoggingSniffer {
    fn received(&mut self, chunk: &mut [u8]) -> Option<usize> {
        self.total += chunk.len() as u64;
        let shown = chunk.len().min(self.preview_bytes);
        trace!(
            peer = ?self.peer,
            bytes = chunk.len(),
            total = self.total,
            preview = %hex::encode(&chunk[..shown]),
            "Upstream data"
        );
        Some(chunk.len())
    }

    fn received_error(&mut self, err: io::Error) -> Option<io::Error> {
        debug!(peer = ?self.peer, error = %err, "Upstream transport error");
        Some(err)
    }
}
