//! # relay-reactor: readiness multiplexer shared by all sessions
//!
//! One epoll instance, one dedicated OS thread. Virtual sockets register
//! their real descriptors together with the mailbox of the session that owns
//! them; the reactor never reads or writes a socket itself.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │   Session task (one per client connection)               │
//! │   register / modify_interest / unregister                │
//! │   drain mailbox → VirtualSocket::handle_ready → re-arm   │
//! └──────────────────▲───────────────────────────────────────┘
//!                    │ Readiness { socket, token, events }
//!                    │ ArrayQueue push + wake()
//! ┌──────────────────┴───────────────────────────────────────┐
//! │   Reactor thread (dedicated OS thread)                   │
//! │   epoll_wait(poll_interval) → fd table → mailbox         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! - **One-shot arming**: a descriptor fires once and stays quiet until the
//!   session has handled the event and re-armed it. Level-triggered
//!   semantics without the reactor spinning on unread data.
//! - **Generation tokens**: epoll user data is `(generation << 32) | fd`, so
//!   a readiness for a closed descriptor whose number was reused is dropped.
//! - **Mailbox per session**: lock-free crossbeam `ArrayQueue`; session state
//!   is only ever touched from the session's own thread of control.

pub mod interest;
pub mod mailbox;
pub mod reactor;

// Re-export the main types
pub use interest::Interest;
pub use mailbox::{Mailbox, Readiness};
pub use reactor::{Reactor, ReactorConfig, ReactorShared, Token};
