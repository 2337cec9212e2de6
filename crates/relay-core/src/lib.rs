//! # relay-core
//!
//! Shared building blocks for the socket relay. Nothing in here touches the
//! network; the reactor and the session crates build on these types.
//!
//! ## Modules
//!
//! - `types` - socket / session identifiers and the transport kind
//! - `error` - error taxonomy (`WireError`, `RelayError`)
//! - `wire` - BSON request/event envelope codec
//! - `config` - `RelayConfig` with environment overrides
//! - `env` - environment variable helpers
//! - `log` - `tracing` subscriber bootstrap

pub mod types;
pub mod error;
pub mod wire;
pub mod config;
pub mod env;
pub mod log;

// Re-exports for convenience
pub use types::{SessionId, SocketId, SocketKind};
pub use error::{ErrorCategory, RelayError, Result, WireError};
pub use wire::{Event, Request};
pub use config::RelayConfig;
pub use env::{env_get, env_get_opt};

/// Protocol constants
pub mod constants {
    use std::net::{Ipv4Addr, SocketAddrV4};

    /// Default bound on concurrently allocated sockets per session.
    pub const MAX_SOCKETS: usize = 4;

    /// Default receive buffer per readiness event.
    pub const RECV_BUFFER_SIZE: usize = 2048;

    /// Destination port that triggers resolver substitution.
    pub const DNS_PORT: u16 = 53;

    /// Default DNS resolver all port-53 traffic is redirected to.
    pub const DEFAULT_DNS_RESOLVER: SocketAddrV4 =
        SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), DNS_PORT);
}
