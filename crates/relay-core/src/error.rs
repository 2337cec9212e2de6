//! Error types for the relay.
//!
//! `WireError` covers envelope decoding/encoding. `RelayError` covers
//! everything a session, virtual socket or the reactor can reject. None of
//! these are fatal: the dispatcher logs them and keeps the session alive.

use crate::types::{SocketId, SocketKind};
use nix::errno::Errno;
use thiserror::Error;

/// Result type alias using the relay's error type.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Envelope-level errors. The offending request is dropped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WireError {
    #[error("malformed document: {0}")]
    Malformed(String),

    #[error("request field `{0}` is not defined")]
    MissingField(&'static str),

    #[error("request field `{field}` is not {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("bad arguments for `{method}`: {reason}")]
    BadArguments { method: &'static str, reason: String },

    #[error("cannot encode event: {0}")]
    Encode(String),
}

/// Broad error classes, used to pick a log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed envelope, unknown method, wrong arguments.
    Protocol,
    /// Socket table limits and identifier conflicts.
    ResourceLimit,
    /// Operation not valid for the socket's kind or state.
    Usage,
    /// Operating system failure.
    Io,
}

/// Session, socket and reactor errors.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error(transparent)]
    Wire(#[from] WireError),

    // Resource limits
    #[error("too many sockets (limit {0})")]
    TooManySockets(usize),

    #[error("unsupported socket kind: {0}")]
    UnsupportedKind(i64),

    #[error("socket id already exists: {0}")]
    DuplicateId(SocketId),

    #[error("send queue full on socket {socket}: {queued} queued, limit {limit}")]
    Backpressure {
        socket: SocketId,
        queued: usize,
        limit: usize,
    },

    // Usage
    #[error("`{op}` is not supported on a {kind} socket")]
    WrongKind { op: &'static str, kind: SocketKind },

    #[error("socket {0} is already bound")]
    AlreadyBound(SocketId),

    #[error("socket {0} already has a connection")]
    AlreadyConnected(SocketId),

    #[error("socket {0} is already connecting")]
    AlreadyConnecting(SocketId),

    #[error("socket {0} is not connected")]
    NotConnected(SocketId),

    #[error("malformed IPv4 address ({0} bytes)")]
    BadAddress(usize),

    // OS
    #[error("{op} failed: {errno}")]
    Io { op: &'static str, errno: Errno },

    #[error("reactor thread: {0}")]
    Spawn(String),
}

impl RelayError {
    /// Wrap the calling thread's current `errno`.
    pub fn last_os(op: &'static str) -> Self {
        RelayError::Io {
            op,
            errno: Errno::last(),
        }
    }

    pub fn os(op: &'static str, errno: Errno) -> Self {
        RelayError::Io { op, errno }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            RelayError::Wire(_) => ErrorCategory::Protocol,
            RelayError::TooManySockets(_)
            | RelayError::UnsupportedKind(_)
            | RelayError::DuplicateId(_)
            | RelayError::Backpressure { .. } => ErrorCategory::ResourceLimit,
            RelayError::WrongKind { .. }
            | RelayError::AlreadyBound(_)
            | RelayError::AlreadyConnected(_)
            | RelayError::AlreadyConnecting(_)
            | RelayError::NotConnected(_)
            | RelayError::BadAddress(_) => ErrorCategory::Usage,
            RelayError::Io { .. } | RelayError::Spawn(_) => ErrorCategory::Io,
        }
    }
}
