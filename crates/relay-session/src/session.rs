//! # Session
//!
//! One session per client connection. It owns the client's virtual socket
//! table, turns decoded requests into socket operations and writes the
//! resulting events back through its `Writer`.
//!
//! Everything on a session runs on the client's own task: requests via
//! `on_message`, readiness via `drain_mailbox`. The reactor thread only
//! touches the session's `Mailbox`.
//!
//! Failed requests are logged and dropped; the protocol has no error reply.
//! The connection stays up whatever the client sends.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use relay_core::{
    ErrorCategory, Event, RelayConfig, RelayError, Request, Result, SessionId, SocketId,
    SocketKind,
};
use relay_reactor::{Mailbox, ReactorShared, Readiness};
use tracing::{debug, error, info, trace, warn};

use crate::vsocket::{SocketContext, SocketState, VirtualSocket};

/// Sink for encoded event frames, one BSON document per call.
pub trait Writer: Send {
    fn write_frame(&mut self, frame: Vec<u8>);
}

impl<F> Writer for F
where
    F: FnMut(Vec<u8>) + Send,
{
    fn write_frame(&mut self, frame: Vec<u8>) {
        self(frame)
    }
}

pub struct Session {
    sockets: HashMap<SocketId, VirtualSocket>,
    ctx: SocketContext,
    writer: Box<dyn Writer>,
    closed: bool,
}

impl Session {
    pub fn new(
        id: SessionId,
        reactor: Arc<ReactorShared>,
        mailbox: Arc<Mailbox>,
        config: Arc<RelayConfig>,
        writer: impl Writer + 'static,
    ) -> Self {
        Self {
            sockets: HashMap::new(),
            ctx: SocketContext {
                session_id: id,
                reactor,
                mailbox,
                config,
            },
            writer: Box::new(writer),
            closed: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.ctx.session_id
    }

    pub fn on_open(&self) {
        info!(session = self.id(), "session opened");
    }

    /// Handle one inbound frame.
    pub fn on_message(&mut self, frame: &[u8]) {
        if self.closed {
            return;
        }
        let request = match Request::decode(frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(session = self.id(), error = %e, "dropping malformed request");
                return;
            }
        };
        trace!(session = self.id(), ?request, "request");

        let method = request.method();
        let socket = request.socket_id();
        let mut events = Vec::new();
        match panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(request, &mut events))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.log_rejection(method, socket, &e),
            Err(_) => error!(session = self.id(), socket, method, "request handler panicked"),
        }
        self.emit(events);
    }

    fn log_rejection(&self, method: &'static str, socket: SocketId, e: &RelayError) {
        match e.category() {
            ErrorCategory::Protocol | ErrorCategory::Usage => {
                warn!(session = self.id(), socket, method, error = %e, "request rejected")
            }
            ErrorCategory::ResourceLimit => {
                warn!(session = self.id(), socket, method, error = %e, "request over limit")
            }
            ErrorCategory::Io => {
                info!(session = self.id(), socket, method, error = %e, "request failed")
            }
        }
    }

    /// Apply one request. Events produced along the way land in `out`, even
    /// when the request itself fails.
    pub fn dispatch(&mut self, request: Request, out: &mut Vec<Event>) -> Result<()> {
        let result = match request {
            Request::Socket { socket_id, kind } => self.open_socket(socket_id, kind),
            Request::SocketClose { socket_id } => {
                self.close_socket(socket_id);
                Ok(())
            }
            Request::Bind { socket_id, port } => self.with_socket(
                socket_id,
                "bind",
                |s, ctx, _| {
                    s.bind(port)?;
                    info!(session = ctx.session_id, socket = socket_id, port, "socket bound");
                    Ok(())
                },
                out,
            ),
            Request::Connect { socket_id, address, port } => self.with_socket(
                socket_id,
                "connect",
                |s, ctx, out| s.connect(ctx, &address, port, out),
                out,
            ),
            Request::Send { socket_id, data } => {
                self.with_socket(socket_id, "send", |s, ctx, _| s.send(ctx, &data), out)
            }
            Request::SendTo { socket_id, address, port, data } => self.with_socket(
                socket_id,
                "sendto",
                |s, ctx, _| s.sendto(ctx, &address, port, &data),
                out,
            ),
        };
        self.reap();
        result
    }

    /// Allocate a virtual socket. Limit, then kind, then id uniqueness.
    fn open_socket(&mut self, socket_id: SocketId, kind: i64) -> Result<()> {
        let max = self.ctx.config.max_sockets;
        if self.sockets.len() >= max {
            return Err(RelayError::TooManySockets(max));
        }
        let kind = SocketKind::from_wire(kind).ok_or(RelayError::UnsupportedKind(kind))?;
        if self.sockets.contains_key(&socket_id) {
            return Err(RelayError::DuplicateId(socket_id));
        }
        self.sockets.insert(socket_id, VirtualSocket::new(socket_id, kind));
        info!(session = self.id(), socket = socket_id, %kind, "socket allocated");
        Ok(())
    }

    fn close_socket(&mut self, socket_id: SocketId) {
        match self.sockets.remove(&socket_id) {
            Some(mut socket) => socket.close(&self.ctx),
            None => debug!(session = self.id(), socket = socket_id, "close of unknown socket"),
        }
    }

    /// Run `op` on a known socket. Unknown ids are ignored.
    fn with_socket<F>(&mut self, socket_id: SocketId, method: &'static str, op: F, out: &mut Vec<Event>) -> Result<()>
    where
        F: FnOnce(&mut VirtualSocket, &SocketContext, &mut Vec<Event>) -> Result<()>,
    {
        match self.sockets.get_mut(&socket_id) {
            Some(socket) => op(socket, &self.ctx, out),
            None => {
                debug!(session = self.ctx.session_id, socket = socket_id, method, "unknown socket");
                Ok(())
            }
        }
    }

    /// Drop sockets that closed themselves; their ids become reusable.
    fn reap(&mut self) {
        self.sockets.retain(|_, s| !s.is_closed());
    }

    fn emit(&mut self, events: Vec<Event>) {
        for event in events {
            match event.encode() {
                Ok(frame) => {
                    trace!(session = self.ctx.session_id, method = event.method(), socket = event.socket_id(), "event");
                    self.writer.write_frame(frame);
                }
                Err(e) => warn!(session = self.ctx.session_id, error = %e, "event encode failed"),
            }
        }
    }

    /// Apply one readiness notification. Stale ones are dropped.
    pub fn on_ready(&mut self, ready: Readiness) {
        if self.closed {
            return;
        }
        let mut events = Vec::new();
        match self.sockets.get_mut(&ready.socket_id) {
            Some(socket) if socket.token() == Some(ready.token) => {
                socket.handle_ready(&self.ctx, ready.events, &mut events);
            }
            _ => {
                trace!(session = self.ctx.session_id, socket = ready.socket_id, "stale readiness");
                return;
            }
        }
        self.reap();
        self.emit(events);
    }

    /// Handle everything the reactor has posted so far. Returns the count.
    pub fn drain_mailbox(&mut self) -> usize {
        let mut n = 0;
        while let Some(ready) = self.ctx.mailbox.pop() {
            self.on_ready(ready);
            n += 1;
        }
        n
    }

    /// Fail connects pending longer than the configured timeout.
    pub fn expire_stalled_connects(&mut self, now: Instant) -> usize {
        let Some(timeout) = self.ctx.config.connect_timeout else {
            return 0;
        };
        let mut events = Vec::new();
        let mut expired = 0;
        for socket in self.sockets.values_mut() {
            if socket.expire_connect(&self.ctx, now, timeout, &mut events) {
                expired += 1;
            }
        }
        if expired > 0 {
            self.reap();
            self.emit(events);
        }
        expired
    }

    /// Tear down every socket. Emits nothing. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let sockets = std::mem::take(&mut self.sockets);
        let count = sockets.len();
        for (_, mut socket) in sockets {
            socket.close(&self.ctx);
        }
        while self.ctx.mailbox.pop().is_some() {}
        info!(session = self.id(), sockets = count, "session closed");
    }

    /// Transport went away.
    pub fn on_close(&mut self) {
        self.close();
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    pub fn contains(&self, socket_id: SocketId) -> bool {
        self.sockets.contains_key(&socket_id)
    }

    pub fn socket_state(&self, socket_id: SocketId) -> Option<SocketState> {
        self.sockets.get(&socket_id).map(VirtualSocket::state)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.ctx.session_id)
            .field("sockets", &self.sockets.len())
            .field("closed", &self.closed)
            .finish()
    }
}
