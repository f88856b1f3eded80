//! Reactor-based TCP relay.
//!
//! A single reactor thread owns the selector, every key's interest ops and
//! the connect-deadline queue. Socket reads and writes run on a worker
//! pool, each one moving bytes through a fixed-size [`TransferBuffer`] per
//! direction. Backpressure comes from withdrawing READ/WRITE interest until
//! the buffer reports room or data again.

pub mod buffer;
pub mod config;
pub mod error;
pub mod executor;
pub mod proxy;
pub mod reactor;
pub mod sniff;

pub use buffer::{BufferStateListener, ByteChannel, LastOperation, Transfer, TransferBuffer};
pub use config::ProxyConfig;
pub use error::{ConfigError, RelayError};
pub use executor::{Executor, WorkerPool};
pub use proxy::{
    CloseReason, Connection, ProxyBufferTransferHandler, ProxyClientHandler, ProxyHandle,
    ProxyListener, ProxyServer, RelayStats, StatsSnapshot,
};
pub use reactor::{DeadlineAction, DeadlineQueue, Reactor, ReactorContext, ReactorHandle};
pub use sniff::{LoggingSnifferFactory, Sniffer, SnifferFactory};
