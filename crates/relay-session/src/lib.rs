//! # relay-session
//!
//! Client sessions and the virtual sockets they own.
//!
//! ## Modules
//!
//! - `sys` - raw non-blocking IPv4 socket calls
//! - `vsocket` - one virtual TCP/UDP socket and its state machine
//! - `session` - per-client socket table and request dispatch
//! - `relay` - reactor + session factory wired together
//!
//! ```rust,ignore
//! let relay = Relay::start(RelayConfig::from_env())?;
//! let mut session = relay.open_session(|frame| ws_send(frame), || notify.notify_one());
//! session.on_message(&frame);   // client request
//! session.drain_mailbox();      // after a wake
//! ```

pub mod sys;
pub mod vsocket;
pub mod session;
pub mod relay;

#[cfg(test)]
mod testutil;

pub use relay::{Relay, SessionIdAllocator};
pub use session::{Session, Writer};
pub use vsocket::{resolve_destination, SocketContext, SocketState, VirtualSocket};
