//! Relay configuration.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::error::ConfigError;

/// Default transfer buffer size per direction (16 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Default upstream connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default number of readiness events fetched per `poll`.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the relay accepts clients on.
    pub listen_addr: SocketAddr,
    /// Upstream destination as `host:port`.
    pub forward_to: String,
    /// Capacity of each directional transfer buffer, in bytes.
    pub buffer_size: usize,
    /// Time allowed for the upstream connect to complete.
    pub connect_timeout: Duration,
    /// Readiness events fetched per selector pass.
    pub event_capacity: usize,
}

impl ProxyConfig {
    /// Create a configuration with default tuning.
    pub fn new(listen_addr: SocketAddr, forward_to: impl Into<String>) -> Self {
        Self {
            listen_addr,
            forward_to: forward_to.into(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Check value ranges without touching the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize(self.buffer_size));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::InvalidEventCapacity(self.event_capacity));
        }
        match self.forward_to.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
            _ => Err(ConfigError::InvalidDestination(self.forward_to.clone())),
        }
    }

    /// Resolve the forward destination to its first socket address.
    ///
    /// Resolution happens once; every connection reuses the result.
    pub fn resolve_destination(&self) -> Result<SocketAddr, ConfigError> {
        self.validate()?;
        let mut addrs =
            self.forward_to
                .to_socket_addrs()
                .map_err(|e| ConfigError::Unresolvable {
                    destination: self.forward_to.clone(),
                    detail: e.to_string(),
                })?;
        addrs.next().ok_or_else(|| ConfigError::Unresolvable {
            destination: self.forward_to.clone(),
            detail: "no addresses".to_string(),
        })
    }
}
