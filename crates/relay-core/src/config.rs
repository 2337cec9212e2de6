//! Relay configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! ```rust,ignore
//! use relay_core::config::RelayConfig;
//!
//! let config = RelayConfig::from_env()
//!     .max_sockets(8)
//!     .connect_timeout(Some(Duration::from_secs(10)));
//! config.validate()?;
//! ```

use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use thiserror::Error;

use crate::constants;
use crate::env::{env_get, env_get_millis};

/// Library defaults.
pub mod defaults {
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    pub const LISTEN_ADDR: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 5000));
    pub const POLL_INTERVAL_MS: u64 = 500;
    pub const SEND_QUEUE_LIMIT: usize = 256 * 1024;
    pub const CONNECT_TIMEOUT_MS: u64 = 0;
    pub const MAILBOX_CAPACITY: usize = 256;
    pub const MAX_EVENTS: usize = 256;
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the WebSocket transport listens on
    pub listen_addr: SocketAddr,
    /// Concurrently allocated sockets per session
    pub max_sockets: usize,
    /// Upper bound on one reactor `poll_once` wait
    pub poll_interval: Duration,
    /// Bytes read per readiness event
    pub recv_buffer_size: usize,
    /// Where every port-53 datagram or connection is redirected
    pub dns_resolver: SocketAddrV4,
    /// Bytes a TCP socket may hold unsent before `send` is rejected
    pub send_queue_limit: usize,
    /// Pending connects older than this fail; `None` waits forever
    pub connect_timeout: Option<Duration>,
    /// Readiness events buffered per session
    pub mailbox_capacity: usize,
    /// Readiness events taken per poll pass
    pub max_events: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RelayConfig {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `RELAY_LISTEN_ADDR` - WebSocket listen address
    /// - `RELAY_MAX_SOCKETS` - Sockets per session
    /// - `RELAY_POLL_INTERVAL_MS` - Reactor poll wait in milliseconds
    /// - `RELAY_RECV_BUFFER` - Bytes per read
    /// - `RELAY_DNS_RESOLVER` - `ip:port` of the DNS resolver
    /// - `RELAY_SEND_QUEUE_LIMIT` - Unsent TCP bytes per socket
    /// - `RELAY_CONNECT_TIMEOUT_MS` - Connect timeout (0 disables)
    /// - `RELAY_MAILBOX_CAPACITY` - Readiness events per session
    /// - `RELAY_MAX_EVENTS` - Readiness events per poll pass
    pub fn from_env() -> Self {
        let base = Self::new();
        let connect_timeout = env_get_millis(
            "RELAY_CONNECT_TIMEOUT_MS",
            defaults::CONNECT_TIMEOUT_MS,
        );
        Self {
            listen_addr: env_get("RELAY_LISTEN_ADDR", base.listen_addr),
            max_sockets: env_get("RELAY_MAX_SOCKETS", base.max_sockets),
            poll_interval: env_get_millis("RELAY_POLL_INTERVAL_MS", defaults::POLL_INTERVAL_MS),
            recv_buffer_size: env_get("RELAY_RECV_BUFFER", base.recv_buffer_size),
            dns_resolver: env_get("RELAY_DNS_RESOLVER", base.dns_resolver),
            send_queue_limit: env_get("RELAY_SEND_QUEUE_LIMIT", base.send_queue_limit),
            connect_timeout: (!connect_timeout.is_zero()).then_some(connect_timeout),
            mailbox_capacity: env_get("RELAY_MAILBOX_CAPACITY", base.mailbox_capacity),
            max_events: env_get("RELAY_MAX_EVENTS", base.max_events),
        }
    }

    /// Create config with library defaults (no env override).
    pub fn new() -> Self {
        Self {
            listen_addr: defaults::LISTEN_ADDR,
            max_sockets: constants::MAX_SOCKETS,
            poll_interval: Duration::from_millis(defaults::POLL_INTERVAL_MS),
            recv_buffer_size: constants::RECV_BUFFER_SIZE,
            dns_resolver: constants::DEFAULT_DNS_RESOLVER,
            send_queue_limit: defaults::SEND_QUEUE_LIMIT,
            connect_timeout: None,
            mailbox_capacity: defaults::MAILBOX_CAPACITY,
            max_events: defaults::MAX_EVENTS,
        }
    }

    // Builder methods

    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn listen_port(mut self, port: u16) -> Self {
        self.listen_addr.set_port(port);
        self
    }

    pub fn max_sockets(mut self, n: usize) -> Self {
        self.max_sockets = n;
        self
    }

    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = d;
        self
    }

    pub fn recv_buffer_size(mut self, n: usize) -> Self {
        self.recv_buffer_size = n;
        self
    }

    pub fn dns_resolver(mut self, addr: SocketAddrV4) -> Self {
        self.dns_resolver = addr;
        self
    }

    pub fn send_queue_limit(mut self, n: usize) -> Self {
        self.send_queue_limit = n;
        self
    }

    pub fn connect_timeout(mut self, d: Option<Duration>) -> Self {
        self.connect_timeout = d;
        self
    }

    pub fn mailbox_capacity(mut self, n: usize) -> Self {
        self.mailbox_capacity = n;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sockets == 0 {
            return Err(ConfigError::InvalidValue("max_sockets must be > 0"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue("poll_interval must be > 0"));
        }
        if self.recv_buffer_size == 0 {
            return Err(ConfigError::InvalidValue("recv_buffer_size must be > 0"));
        }
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::InvalidValue("mailbox_capacity must be > 0"));
        }
        if self.max_events == 0 {
            return Err(ConfigError::InvalidValue("max_events must be > 0"));
        }
        Ok(())
    }

    /// Log the effective configuration.
    pub fn log_summary(&self) {
        tracing::info!(
            listen = %self.listen_addr,
            max_sockets = self.max_sockets,
            poll_interval = ?self.poll_interval,
            recv_buffer = self.recv_buffer_size,
            dns_resolver = %self.dns_resolver,
            send_queue_limit = self.send_queue_limit,
            connect_timeout = ?self.connect_timeout,
            mailbox_capacity = self.mailbox_capacity,
            max_events = self.max_events,
            "relay configuration"
        );
    }
}

/// Configuration error
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    InvalidValue(&'static str),
}
