//! Identifier types and the virtual socket transport kind.

use std::fmt;

/// Client-chosen socket identifier, unique within one session.
pub type SocketId = i64;

/// Process-unique session identifier.
pub type SessionId = u64;

/// Transport kind of a virtual socket. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Tcp,
    Udp,
}

impl SocketKind {
    /// Map the wire value (`0` = TCP, `1` = UDP).
    pub fn from_wire(v: i64) -> Option<Self> {
        match v {
            0 => Some(SocketKind::Tcp),
            1 => Some(SocketKind::Udp),
            _ => None,
        }
    }

    pub fn to_wire(self) -> i64 {
        match self {
            SocketKind::Tcp => 0,
            SocketKind::Udp => 1,
        }
    }
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketKind::Tcp => write!(f, "tcp"),
            SocketKind::Udp => write!(f, "udp"),
        }
    }
}
