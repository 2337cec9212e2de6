//! Readiness mask shared by registrations and delivered events.
//!
//! The same bits describe what a socket wants to hear about and what the
//! reactor observed. `HANGUP` and `ERROR` are always reported by epoll; they
//! are kept in the mask so a handler can test for them uniformly.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u32);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(1 << 0);
    pub const WRITE: Interest = Interest(1 << 1);
    pub const HANGUP: Interest = Interest(1 << 2);
    pub const ERROR: Interest = Interest(1 << 3);

    #[inline]
    pub fn contains(self, other: Interest) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// epoll event bits for a one-shot registration with this interest.
    pub(crate) fn to_epoll(self) -> u32 {
        let mut bits = libc::EPOLLONESHOT as u32;
        if self.contains(Interest::READ) {
            bits |= libc::EPOLLIN as u32;
        }
        if self.contains(Interest::WRITE) {
            bits |= libc::EPOLLOUT as u32;
        }
        bits
    }

    /// Translate epoll's reported bits.
    pub(crate) fn from_epoll(bits: u32) -> Interest {
        let mut out = Interest::NONE;
        if bits & (libc::EPOLLIN as u32 | libc::EPOLLPRI as u32) != 0 {
            out |= Interest::READ;
        }
        if bits & libc::EPOLLOUT as u32 != 0 {
            out |= Interest::WRITE;
        }
        if bits & libc::EPOLLHUP as u32 != 0 {
            out |= Interest::HANGUP;
        }
        if bits & libc::EPOLLERR as u32 != 0 {
            out |= Interest::ERROR;
        }
        out
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let names = [
            (Interest::READ, "READ"),
            (Interest::WRITE, "WRITE"),
            (Interest::HANGUP, "HANGUP"),
            (Interest::ERROR, "ERROR"),
        ];
        let mut first = true;
        for (bit, name) in names {
            if self.contains(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}
