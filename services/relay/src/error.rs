//! Error types for the relay.

use std::io;

use thiserror::Error;

/// Configuration errors, reported before any socket is opened.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Transfer buffers must hold at least one byte.
    #[error("invalid buffer size: {0} (must be at least 1 byte)")]
    InvalidBufferSize(usize),

    /// The forward destination is empty or not `host:port`.
    #[error("invalid forward destination: {0:?}")]
    InvalidDestination(String),

    /// The forward destination did not resolve to any address.
    #[error("forward destination {destination} did not resolve: {detail}")]
    Unresolvable { destination: String, detail: String },

    /// Event capacity must be non-zero.
    #[error("invalid event capacity: {0}")]
    InvalidEventCapacity(usize),
}

/// Top-level relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Socket or selector failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The reactor thread panicked.
    #[error("reactor thread panicked")]
    ReactorPanicked,
}

impl RelayError {
    /// Short machine-readable reason code.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RelayError::Config(_) => "config_error",
            RelayError::Io(_) => "io_error",
            RelayError::ReactorPanicked => "reactor_panicked",
        }
    }
}

pub type Result<T, E = RelayError> = std::result::Result<T, E>;
