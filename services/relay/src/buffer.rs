//! Single-buffer transfer between two sockets.
//!
//! A [`TransferBuffer`] carries one direction of a relayed connection. One
//! worker fills it from the source socket (`read`), another drains it into
//! the destination socket (`write`). The buffer alternates between a fill
//! mode and a drain mode:
//!
//! ```text
//!   READ mode:   [ data .......... | free ............ ]
//!                  0              pos                cap
//!   WRITE mode:  [ sent ... | pending ...... | ....... ]
//!                  0        pos            limit     cap
//! ```
//!
//! Switching READ→WRITE flips (pending = everything filled so far);
//! switching WRITE→READ compacts the unsent bytes to the front. Both
//! operations run under the buffer lock, so a fill and a drain never
//! interleave mid-switch.
//!
//! State changes are announced through two [`BufferStateListener`]s:
//! - data-available: there is something (bytes or EOF) for the drainer
//! - room-available: the filler may read again
//!
//! End of stream is sticky. Once the source reports EOF its read side is
//! shut down, and the drain that empties the buffer afterwards shuts down
//! the destination's write side, exactly once.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::Arc;

use mio::net::TcpStream;
use parking_lot::Mutex;
use tracing::debug;

use crate::sniff::Sniffer;

/// A non-blocking byte stream the buffer can fill from and drain into.
pub trait ByteChannel: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&self, buf: &[u8]) -> io::Result<usize>;
    fn shutdown(&self, how: Shutdown) -> io::Result<()>;
}

impl ByteChannel for TcpStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Write::write(&mut &*self, buf)
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        TcpStream::shutdown(self, how)
    }
}

/// Callback announcing a buffer state change.
///
/// Invoked synchronously on the worker thread that performed the I/O. It
/// must not block; the expected implementation enqueues a task for the
/// reactor and wakes it.
pub trait BufferStateListener: Send + Sync {
    fn notify(&self);
}

impl<F> BufferStateListener for F
where
    F: Fn() + Send + Sync,
{
    fn notify(&self) {
        self()
    }
}

/// The operation the buffer was last switched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastOperation {
    Read,
    Write,
}

/// Outcome of filling the buffer from a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Bytes added to the buffer (zero when the channel had nothing or the
    /// buffer is full).
    Bytes(usize),
    /// The source reached end of stream.
    Eof,
}

struct Inner {
    buf: Box<[u8]>,
    pos: usize,
    limit: usize,
    last_op: LastOperation,
    eof: bool,
    output_shutdown: bool,
    bytes_written: u64,
    data_listener: Option<Arc<dyn BufferStateListener>>,
    room_listener: Option<Arc<dyn BufferStateListener>>,
    sniffer: Option<Box<dyn Sniffer>>,
}

impl Inner {
    fn compact(&mut self) {
        let (pos, limit) = (self.pos, self.limit);
        self.buf.copy_within(pos..limit, 0);
        self.pos = limit - pos;
        self.limit = self.buf.len();
        self.last_op = LastOperation::Read;
    }

    fn flip(&mut self) {
        self.limit = self.pos;
        self.pos = 0;
        self.last_op = LastOperation::Write;
    }

    fn pending(&self) -> usize {
        match self.last_op {
            LastOperation::Read => self.pos,
            LastOperation::Write => self.limit - self.pos,
        }
    }

    /// Route a hard I/O error through the sniffer, which may swallow it.
    fn filter_error(&mut self, err: io::Error) -> io::Result<()> {
        match self.sniffer.as_mut() {
            Some(sniffer) => match sniffer.received_error(err) {
                Some(err) => Err(err),
                None => Ok(()),
            },
            None => Err(err),
        }
    }
}

/// Fixed-capacity buffer mediating one direction of a relay.
pub struct TransferBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl TransferBuffer {
    /// Create an empty buffer in READ mode.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "transfer buffer capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                buf: vec![0u8; capacity].into_boxed_slice(),
                pos: 0,
                limit: capacity,
                last_op: LastOperation::Read,
                eof: false,
                output_shutdown: false,
                bytes_written: 0,
                data_listener: None,
                room_listener: None,
                sniffer: None,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Install the listener told when there is something to drain.
    pub fn set_data_listener(&self, listener: Arc<dyn BufferStateListener>) {
        self.inner.lock().data_listener = Some(listener);
    }

    /// Install the listener told when the buffer can be filled again.
    pub fn set_room_listener(&self, listener: Arc<dyn BufferStateListener>) {
        self.inner.lock().room_listener = Some(listener);
    }

    /// Attach a sniffer; it sees every subsequent chunk and error.
    pub fn set_sniffer(&self, sniffer: Box<dyn Sniffer>) {
        self.inner.lock().sniffer = Some(sniffer);
    }

    pub fn has_sniffer(&self) -> bool {
        self.inner.lock().sniffer.is_some()
    }

    /// Whether the source has reached end of stream.
    pub fn is_eof(&self) -> bool {
        self.inner.lock().eof
    }

    /// Whether the destination's write side has been shut down.
    pub fn is_output_shutdown(&self) -> bool {
        self.inner.lock().output_shutdown
    }

    /// Bytes buffered and not yet drained.
    pub fn pending(&self) -> usize {
        self.inner.lock().pending()
    }

    /// Total bytes drained into the destination.
    pub fn bytes_written(&self) -> u64 {
        self.inner.lock().bytes_written
    }

    pub fn last_operation(&self) -> LastOperation {
        self.inner.lock().last_op
    }

    /// Fill the buffer with a single non-blocking read from `channel`.
    ///
    /// `WouldBlock` counts as zero bytes. On end of stream the channel's
    /// read side is shut down. Fires data-available when bytes were added
    /// or EOF was seen, and room-available when nothing was read but the
    /// buffer still has room (so the reader is re-armed).
    pub fn read<C>(&self, channel: &C) -> io::Result<Transfer>
    where
        C: ByteChannel + ?Sized,
    {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.last_op == LastOperation::Write {
            inner.compact();
        }
        if inner.eof {
            return Ok(Transfer::Eof);
        }

        let start = inner.pos;
        let mut outcome = if start == inner.buf.len() {
            Transfer::Bytes(0)
        } else {
            match channel.read(&mut inner.buf[start..]) {
                Ok(0) => Transfer::Eof,
                Ok(n) => Transfer::Bytes(n),
                Err(e) if is_transient(&e) => Transfer::Bytes(0),
                Err(e) => {
                    inner.filter_error(e)?;
                    Transfer::Bytes(0)
                }
            }
        };

        if let (Transfer::Bytes(n), Some(sniffer)) = (outcome, inner.sniffer.as_mut()) {
            if n > 0 {
                outcome = match sniffer.received(&mut inner.buf[start..start + n]) {
                    Some(kept) => Transfer::Bytes(kept.min(n)),
                    None => Transfer::Eof,
                };
            }
        }

        let notify = match outcome {
            Transfer::Bytes(n) => {
                inner.pos += n;
                if n > 0 {
                    inner.data_listener.clone()
                } else if inner.pos < inner.buf.len() {
                    inner.room_listener.clone()
                } else {
                    None
                }
            }
            Transfer::Eof => {
                inner.eof = true;
                if let Err(e) = channel.shutdown(Shutdown::Read) {
                    debug!(error = %e, "Input shutdown failed");
                }
                inner.data_listener.clone()
            }
        };
        drop(guard);

        if let Some(listener) = notify {
            listener.notify();
        }
        Ok(outcome)
    }

    /// Drain the buffer with a single non-blocking write into `channel`.
    ///
    /// Returns the bytes written (zero on `WouldBlock`). Once the source is
    /// at EOF and nothing is left, the channel's write side is shut down;
    /// this happens at most once. Fires room-available when bytes left the
    /// buffer and data-available when bytes remain to be sent.
    pub fn write<C>(&self, channel: &C) -> io::Result<usize>
    where
        C: ByteChannel + ?Sized,
    {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.last_op == LastOperation::Read {
            inner.flip();
        }

        let written = if inner.pos == inner.limit {
            0
        } else {
            match channel.write(&inner.buf[inner.pos..inner.limit]) {
                Ok(n) => n,
                Err(e) if is_transient(&e) => 0,
                Err(e) => {
                    inner.filter_error(e)?;
                    0
                }
            }
        };
        inner.pos += written;
        inner.bytes_written += written as u64;

        let remaining = inner.limit - inner.pos;
        let half_close = remaining == 0 && inner.eof && !inner.output_shutdown;
        if half_close {
            inner.output_shutdown = true;
        }

        let room = if written > 0 && !inner.eof {
            inner.room_listener.clone()
        } else {
            None
        };
        let data = if remaining > 0 {
            inner.data_listener.clone()
        } else {
            None
        };
        drop(guard);

        if half_close {
            if let Err(e) = channel.shutdown(Shutdown::Write) {
                debug!(error = %e, "Output shutdown failed");
            }
        }
        if let Some(listener) = room {
            listener.notify();
        }
        if let Some(listener) = data {
            listener.notify();
        }
        Ok(written)
    }
}

impl fmt::Debug for TransferBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TransferBuffer")
            .field("capacity", &self.capacity)
            .field("pending", &inner.pending())
            .field("last_op", &inner.last_op)
            .field("eof", &inner.eof)
            .field("output_shutdown", &inner.output_shutdown)
            .finish()
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
