//! # Virtual sockets
//!
//! A `VirtualSocket` is what a client sees: an id, a kind, an optional local
//! port. The real OS socket behind it is created lazily on the first
//! `connect` (TCP) or `sendto` (UDP) and registered with the reactor.
//!
//! ```text
//! TCP:  UNBOUND ─bind─▶ BOUND ─connect─▶ CONNECTING ─writable─▶ CONNECTED
//!          │              │                  │ error/timeout        │
//!          └──────────────┴──────connect─────┴──────────▶ CLOSED ◀──┘ EOF/hangup/close
//!
//! UDP:  UNBOUND ─bind─▶ BOUND ─sendto─▶ OPEN ─hangup/close─▶ CLOSED
//! ```
//!
//! Operations never block. Connect completion, inbound data and peer
//! hangups arrive later as `Readiness` through the session's mailbox and are
//! handled in `handle_ready`, which emits client events into `out`.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use relay_core::constants::DNS_PORT;
use relay_core::{Event, RelayConfig, RelayError, Result, SessionId, SocketId, SocketKind};
use relay_reactor::{Interest, Mailbox, ReactorShared, Token};
use tracing::{debug, info, trace, warn};

use crate::sys::{self, ConnectStatus};

/// Everything a virtual socket needs from its session.
pub struct SocketContext {
    pub session_id: SessionId,
    pub reactor: Arc<ReactorShared>,
    pub mailbox: Arc<Mailbox>,
    pub config: Arc<RelayConfig>,
}

/// Client-visible socket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Unbound,
    Bound,
    /// TCP connect issued, outcome pending.
    Connecting,
    Connected,
    /// UDP socket with a real descriptor.
    Open,
    Closed,
}

/// Where traffic for `address:port` really goes. Port 53 is always
/// redirected to the configured resolver, whatever the address says.
pub fn resolve_destination(address: &[u8], port: u16, dns_resolver: SocketAddrV4) -> Result<SocketAddrV4> {
    if port == DNS_PORT {
        return Ok(dns_resolver);
    }
    let octets: [u8; 4] = address
        .try_into()
        .map_err(|_| RelayError::BadAddress(address.len()))?;
    Ok(SocketAddrV4::new(Ipv4Addr::from(octets), port))
}

pub struct VirtualSocket {
    id: SocketId,
    kind: SocketKind,
    /// `None` until `bind`; `Some(0)` asks for an ephemeral port.
    local_port: Option<u16>,
    fd: Option<OwnedFd>,
    token: Option<Token>,
    /// Set while a TCP connect is pending.
    connect_started: Option<Instant>,
    connected: bool,
    /// Bytes accepted by `send` but not yet taken by the OS.
    outbound: Vec<u8>,
    closed: bool,
}

impl VirtualSocket {
    pub fn new(id: SocketId, kind: SocketKind) -> Self {
        Self {
            id,
            kind,
            local_port: None,
            fd: None,
            token: None,
            connect_started: None,
            connected: false,
            outbound: Vec::new(),
            closed: false,
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    pub fn state(&self) -> SocketState {
        if self.closed {
            return SocketState::Closed;
        }
        match (self.kind, self.fd.is_some()) {
            (SocketKind::Tcp, _) if self.connect_started.is_some() => SocketState::Connecting,
            (SocketKind::Tcp, _) if self.connected => SocketState::Connected,
            (SocketKind::Udp, true) => SocketState::Open,
            _ if self.local_port.is_some() => SocketState::Bound,
            _ => SocketState::Unbound,
        }
    }

    /// Interest to arm the descriptor with after handling an event.
    fn interest(&self) -> Interest {
        let mut interest = Interest::READ | Interest::HANGUP | Interest::ERROR;
        if self.connect_started.is_some() || !self.outbound.is_empty() {
            interest |= Interest::WRITE;
        }
        interest
    }

    fn rearm(&self, ctx: &SocketContext) -> Result<()> {
        match &self.fd {
            Some(fd) => ctx.reactor.modify_interest(fd.as_raw_fd(), self.interest()),
            None => Ok(()),
        }
    }

    /// Record the local port. Only valid before any traffic.
    pub fn bind(&mut self, port: u16) -> Result<()> {
        if self.fd.is_some() || self.closed {
            return Err(RelayError::AlreadyConnected(self.id));
        }
        if self.local_port.is_some() {
            return Err(RelayError::AlreadyBound(self.id));
        }
        self.local_port = Some(port);
        Ok(())
    }

    /// Create the real socket and bind it to the requested local port.
    fn create_real(&self) -> Result<OwnedFd> {
        let fd = sys::open(self.kind).map_err(|e| RelayError::os("socket", e))?;
        let port = self.local_port.unwrap_or(0);
        if port != 0 {
            sys::set_reuse_addr(&fd).map_err(|e| RelayError::os("setsockopt", e))?;
        }
        sys::bind_any(&fd, port).map_err(|e| RelayError::os("bind", e))?;
        Ok(fd)
    }

    /// Register `fd` with the reactor under the current interest and take
    /// ownership of it.
    fn attach(&mut self, ctx: &SocketContext, fd: OwnedFd) -> Result<()> {
        let token = ctx
            .reactor
            .register(fd.as_raw_fd(), self.id, &ctx.mailbox, self.interest())?;
        debug!(
            session = ctx.session_id,
            socket = self.id,
            kind = %self.kind,
            local_port = sys::local_port(&fd).unwrap_or(0),
            "real socket attached"
        );
        self.fd = Some(fd);
        self.token = Some(token);
        Ok(())
    }

    /// Start a TCP connect. Outcome is reported as `connected(1|0)`, now or
    /// on a later readiness event.
    pub fn connect(
        &mut self,
        ctx: &SocketContext,
        address: &[u8],
        port: u16,
        out: &mut Vec<Event>,
    ) -> Result<()> {
        if self.kind != SocketKind::Tcp {
            return Err(RelayError::WrongKind { op: "connect", kind: self.kind });
        }
        if self.connect_started.is_some() {
            return Err(RelayError::AlreadyConnecting(self.id));
        }
        if self.fd.is_some() || self.closed {
            return Err(RelayError::AlreadyConnected(self.id));
        }
        let dest = resolve_destination(address, port, ctx.config.dns_resolver)?;

        let fd = match self.create_real() {
            Ok(fd) => fd,
            Err(e) => {
                self.fail_connect(ctx, out);
                return Err(e);
            }
        };
        // An unconnected stream socket polls as hung up, so registration
        // waits until connect has been issued.
        let connected = match sys::connect(&fd, dest) {
            Ok(ConnectStatus::Connected) => true,
            Ok(ConnectStatus::InProgress) => false,
            Err(e) => {
                self.fail_connect(ctx, out);
                return Err(RelayError::os("connect", e));
            }
        };
        if connected {
            self.connected = true;
        } else {
            self.connect_started = Some(Instant::now());
        }
        if let Err(e) = self.attach(ctx, fd) {
            self.fail_connect(ctx, out);
            return Err(e);
        }

        if connected {
            info!(session = ctx.session_id, socket = self.id, %dest, "connected");
            out.push(Event::Connected { socket_id: self.id, success: true });
        } else {
            info!(session = ctx.session_id, socket = self.id, %dest, "connecting");
        }
        Ok(())
    }

    /// Resolve the connect as failed and close.
    fn fail_connect(&mut self, ctx: &SocketContext, out: &mut Vec<Event>) {
        self.connect_started = None;
        info!(session = ctx.session_id, socket = self.id, "connect failed");
        out.push(Event::Connected { socket_id: self.id, success: false });
        self.close(ctx);
    }

    /// Fail a connect that has been pending for at least `timeout`.
    /// Returns true if it fired.
    pub fn expire_connect(
        &mut self,
        ctx: &SocketContext,
        now: Instant,
        timeout: Duration,
        out: &mut Vec<Event>,
    ) -> bool {
        match self.connect_started {
            Some(started) if now.saturating_duration_since(started) >= timeout => {
                warn!(session = ctx.session_id, socket = self.id, ?timeout, "connect timed out");
                self.fail_connect(ctx, out);
                true
            }
            _ => false,
        }
    }

    /// Write on a TCP connection. Whatever the OS does not take now is
    /// queued and flushed on write readiness.
    pub fn send(&mut self, ctx: &SocketContext, data: &[u8]) -> Result<()> {
        if self.kind != SocketKind::Tcp {
            return Err(RelayError::WrongKind { op: "send", kind: self.kind });
        }
        let Some(fd) = self.fd.as_ref().filter(|_| !self.closed) else {
            return Err(RelayError::NotConnected(self.id));
        };

        let written = if self.connect_started.is_some() || !self.outbound.is_empty() {
            0
        } else {
            match sys::send(fd, data) {
                Ok(n) => n,
                Err(e) if sys::would_block(e) => 0,
                Err(e) => return Err(RelayError::os("send", e)),
            }
        };
        if written == data.len() {
            return Ok(());
        }

        let rest = &data[written..];
        let limit = ctx.config.send_queue_limit;
        if self.outbound.len() + rest.len() > limit {
            // The written prefix is already on the wire; the rest is dropped.
            return Err(RelayError::Backpressure {
                socket: self.id,
                queued: self.outbound.len(),
                limit,
            });
        }
        let was_idle = self.outbound.is_empty();
        self.outbound.extend_from_slice(rest);
        trace!(session = ctx.session_id, socket = self.id, queued = self.outbound.len(), "send queued");
        if was_idle {
            self.rearm(ctx)?;
        }
        Ok(())
    }

    /// Send one datagram, opening the UDP socket on first use.
    pub fn sendto(&mut self, ctx: &SocketContext, address: &[u8], port: u16, data: &[u8]) -> Result<()> {
        if self.kind != SocketKind::Udp {
            return Err(RelayError::WrongKind { op: "sendto", kind: self.kind });
        }
        if self.closed {
            return Err(RelayError::NotConnected(self.id));
        }
        let dest = resolve_destination(address, port, ctx.config.dns_resolver)?;

        if self.fd.is_none() {
            let fd = self.create_real()?;
            self.attach(ctx, fd)?;
            info!(session = ctx.session_id, socket = self.id, "udp socket opened");
        }
        let Some(fd) = self.fd.as_ref() else {
            return Err(RelayError::NotConnected(self.id));
        };
        let n = sys::send_to(fd, data, dest).map_err(|e| RelayError::os("sendto", e))?;
        trace!(session = ctx.session_id, socket = self.id, %dest, bytes = n, "datagram sent");
        Ok(())
    }

    /// Handle one readiness event. Bits are evaluated in the fixed order
    /// error, write, read, hangup. Re-arms the descriptor if still open.
    pub fn handle_ready(&mut self, ctx: &SocketContext, events: Interest, out: &mut Vec<Event>) {
        if self.closed || self.fd.is_none() {
            return;
        }

        if events.contains(Interest::ERROR) {
            let err = self.fd.as_ref().and_then(|fd| sys::take_error(fd).ok().flatten());
            if self.connect_started.is_some() {
                debug!(session = ctx.session_id, socket = self.id, error = ?err, "connect error");
                self.fail_connect(ctx, out);
                return;
            }
            if let Some(e) = err {
                debug!(session = ctx.session_id, socket = self.id, error = %e, "socket error");
            }
        }

        if events.contains(Interest::WRITE) {
            if self.connect_started.is_some() {
                let err = self.fd.as_ref().and_then(|fd| sys::take_error(fd).ok().flatten());
                if let Some(e) = err {
                    debug!(session = ctx.session_id, socket = self.id, error = %e, "connect refused");
                    self.fail_connect(ctx, out);
                    return;
                }
                self.connect_started = None;
                self.connected = true;
                info!(session = ctx.session_id, socket = self.id, "connected");
                out.push(Event::Connected { socket_id: self.id, success: true });
            }
            if let Err(e) = self.flush_outbound() {
                debug!(session = ctx.session_id, socket = self.id, error = %e, "flush failed");
                self.peer_gone(ctx, out);
                return;
            }
        }

        if events.contains(Interest::READ) {
            self.read_ready(ctx, out);
            if self.closed {
                return;
            }
        }

        if events.contains(Interest::HANGUP) {
            info!(session = ctx.session_id, socket = self.id, "peer hung up");
            self.peer_gone(ctx, out);
            return;
        }

        if let Err(e) = self.rearm(ctx) {
            warn!(session = ctx.session_id, socket = self.id, error = %e, "re-arm failed");
            self.peer_gone(ctx, out);
        }
    }

    fn flush_outbound(&mut self) -> std::result::Result<(), Errno> {
        let Some(fd) = self.fd.as_ref() else {
            return Ok(());
        };
        let mut sent = 0;
        while sent < self.outbound.len() {
            match sys::send(fd, &self.outbound[sent..]) {
                Ok(n) => sent += n,
                Err(e) if sys::would_block(e) => break,
                Err(e) => return Err(e),
            }
        }
        self.outbound.drain(..sent);
        Ok(())
    }

    fn read_ready(&mut self, ctx: &SocketContext, out: &mut Vec<Event>) {
        let Some(fd) = self.fd.as_ref() else {
            return;
        };
        let mut buf = vec![0u8; ctx.config.recv_buffer_size];
        match sys::recv(fd, &mut buf) {
            Ok(0) if self.kind == SocketKind::Tcp => {
                info!(session = ctx.session_id, socket = self.id, "peer closed");
                self.peer_gone(ctx, out);
            }
            Ok(n) => {
                buf.truncate(n);
                trace!(session = ctx.session_id, socket = self.id, bytes = n, "recv");
                out.push(Event::Recv { socket_id: self.id, data: buf });
            }
            Err(e) if sys::would_block(e) => {}
            Err(e) => {
                info!(session = ctx.session_id, socket = self.id, error = %e, "recv failed");
                self.peer_gone(ctx, out);
            }
        }
    }

    /// Report `closed` once and release the socket.
    fn peer_gone(&mut self, ctx: &SocketContext, out: &mut Vec<Event>) {
        if self.closed {
            return;
        }
        out.push(Event::Closed { socket_id: self.id });
        self.close(ctx);
    }

    /// Idempotent. Deregisters before the descriptor is released.
    pub fn close(&mut self, ctx: &SocketContext) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.connect_started = None;
        self.connected = false;
        self.token = None;
        self.outbound = Vec::new();
        if let Some(fd) = self.fd.take() {
            if let Err(e) = ctx.reactor.unregister(fd.as_raw_fd()) {
                warn!(session = ctx.session_id, socket = self.id, error = %e, "unregister failed");
            }
        }
        info!(session = ctx.session_id, socket = self.id, "socket closed");
    }
}

impl std::fmt::Debug for VirtualSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualSocket")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("local_port", &self.local_port)
            .field("queued", &self.outbound.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{StalledListener, IO_TIMEOUT};
    use relay_reactor::ReactorConfig;
    use std::net::{TcpListener, UdpSocket};

    const WAIT: Duration = Duration::from_millis(100);

    /// Loopback UDP peer that fails the test instead of blocking forever.
    fn udp_peer() -> UdpSocket {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
        sock
    }

    fn ctx() -> SocketContext {
        ctx_with(RelayConfig::new())
    }

    fn ctx_with(config: RelayConfig) -> SocketContext {
        SocketContext {
            session_id: 1,
            reactor: Arc::new(ReactorShared::new(&ReactorConfig::default()).unwrap()),
            mailbox: Arc::new(Mailbox::polled(64)),
            config: Arc::new(config),
        }
    }

    /// Poll and feed readiness to `sock` until `out` satisfies `done`.
    fn pump(ctx: &SocketContext, sock: &mut VirtualSocket, out: &mut Vec<Event>, done: impl Fn(&[Event]) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(out) && Instant::now() < deadline {
            ctx.reactor.poll_once(WAIT).unwrap();
            while let Some(ev) = ctx.mailbox.pop() {
                if sock.token() == Some(ev.token) {
                    sock.handle_ready(ctx, ev.events, out);
                }
            }
        }
    }

    #[test]
    fn test_resolve_destination() {
        let google = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53);
        assert_eq!(
            resolve_destination(&[93, 184, 216, 34], 80, google).unwrap(),
            "93.184.216.34:80".parse::<SocketAddrV4>().unwrap()
        );
        // Port 53 goes to the resolver whatever the address.
        assert_eq!(resolve_destination(&[10, 0, 0, 1], 53, google).unwrap(), google);
        assert_eq!(resolve_destination(b"garbage", 53, google).unwrap(), google);
        assert!(matches!(
            resolve_destination(&[1, 2, 3], 80, google),
            Err(RelayError::BadAddress(3))
        ));
    }

    #[test]
    fn test_state_transitions_bind() {
        let mut s = VirtualSocket::new(1, SocketKind::Tcp);
        assert_eq!(s.state(), SocketState::Unbound);
        s.bind(0).unwrap();
        assert_eq!(s.state(), SocketState::Bound);
        assert!(matches!(s.bind(1234), Err(RelayError::AlreadyBound(1))));
        assert_eq!(s.local_port(), Some(0));
    }

    #[test]
    fn test_kind_checks() {
        let ctx = ctx();
        let mut out = Vec::new();

        let mut udp = VirtualSocket::new(1, SocketKind::Udp);
        assert!(matches!(
            udp.connect(&ctx, &[127, 0, 0, 1], 80, &mut out),
            Err(RelayError::WrongKind { op: "connect", .. })
        ));
        assert!(matches!(
            udp.send(&ctx, b"x"),
            Err(RelayError::WrongKind { op: "send", .. })
        ));

        let mut tcp = VirtualSocket::new(2, SocketKind::Tcp);
        assert!(matches!(
            tcp.sendto(&ctx, &[127, 0, 0, 1], 80, b"x"),
            Err(RelayError::WrongKind { op: "sendto", .. })
        ));
        assert!(matches!(tcp.send(&ctx, b"x"), Err(RelayError::NotConnected(2))));

        assert!(out.is_empty());
        assert_eq!(ctx.reactor.registered(), 0);
    }

    #[test]
    fn test_malformed_address_is_rejected_without_socket() {
        let ctx = ctx();
        let mut udp = VirtualSocket::new(1, SocketKind::Udp);
        assert!(matches!(
            udp.sendto(&ctx, &[1, 2], 9, b"x"),
            Err(RelayError::BadAddress(2))
        ));
        assert_eq!(udp.state(), SocketState::Unbound);
        assert_eq!(ctx.reactor.registered(), 0);
    }

    #[test]
    fn test_udp_lazy_open_and_recv() {
        let ctx = ctx();
        let peer = udp_peer();
        let peer_port = peer.local_addr().unwrap().port();

        let mut udp = VirtualSocket::new(7, SocketKind::Udp);
        assert!(udp.token().is_none());
        udp.sendto(&ctx, &[127, 0, 0, 1], peer_port, b"ping").unwrap();
        assert_eq!(udp.state(), SocketState::Open);
        assert_eq!(ctx.reactor.registered(), 1);

        let mut buf = [0u8; 64];
        let (n, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        peer.send_to(b"pong", from).unwrap();

        let mut out = Vec::new();
        pump(&ctx, &mut udp, &mut out, |o| !o.is_empty());
        assert_eq!(out, vec![Event::Recv { socket_id: 7, data: b"pong".to_vec() }]);
    }

    #[test]
    fn test_udp_dns_redirect() {
        let resolver = udp_peer();
        let resolver_addr = match resolver.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            other => panic!("unexpected {other}"),
        };
        let ctx = ctx_with(RelayConfig::new().dns_resolver(resolver_addr));

        let mut udp = VirtualSocket::new(1, SocketKind::Udp);
        // Address is ignored for port 53.
        udp.sendto(&ctx, &[203, 0, 113, 9], 53, b"query").unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = resolver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"query");
    }

    #[test]
    fn test_udp_bound_port_is_used() {
        let ctx = ctx();
        let peer = udp_peer();
        let peer_port = peer.local_addr().unwrap().port();

        // Borrow a free port, release it, then bind the virtual socket to it.
        let port = UdpSocket::bind("0.0.0.0:0").unwrap().local_addr().unwrap().port();
        let mut udp = VirtualSocket::new(1, SocketKind::Udp);
        udp.bind(port).unwrap();
        udp.sendto(&ctx, &[127, 0, 0, 1], peer_port, b"x").unwrap();

        let mut buf = [0u8; 8];
        let (_, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(from.port(), port);
    }

    #[test]
    fn test_tcp_connect_send_and_peer_close() {
        let ctx = ctx();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut tcp = VirtualSocket::new(3, SocketKind::Tcp);
        let mut out = Vec::new();
        tcp.connect(&ctx, &[127, 0, 0, 1], port, &mut out).unwrap();
        pump(&ctx, &mut tcp, &mut out, |o| !o.is_empty());
        assert_eq!(out, vec![Event::Connected { socket_id: 3, success: true }]);
        assert_eq!(tcp.state(), SocketState::Connected);
        assert!(matches!(
            tcp.connect(&ctx, &[127, 0, 0, 1], port, &mut Vec::new()),
            Err(RelayError::AlreadyConnected(3))
        ));

        let (mut accepted, _) = listener.accept().unwrap();
        accepted.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
        tcp.send(&ctx, b"hello").unwrap();
        let mut buf = [0u8; 5];
        std::io::Read::read_exact(&mut accepted, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        drop(accepted);
        out.clear();
        pump(&ctx, &mut tcp, &mut out, |o| !o.is_empty());
        assert_eq!(out, vec![Event::Closed { socket_id: 3 }]);
        assert!(tcp.is_closed());
        assert_eq!(ctx.reactor.registered(), 0);
    }

    #[test]
    fn test_tcp_connect_refused() {
        let ctx = ctx();
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();

        let mut tcp = VirtualSocket::new(3, SocketKind::Tcp);
        let mut out = Vec::new();
        let _ = tcp.connect(&ctx, &[127, 0, 0, 1], port, &mut out);
        pump(&ctx, &mut tcp, &mut out, |o| !o.is_empty());

        assert_eq!(out, vec![Event::Connected { socket_id: 3, success: false }]);
        assert_eq!(tcp.state(), SocketState::Closed);
        assert!(matches!(tcp.send(&ctx, b"x"), Err(RelayError::NotConnected(3))));
        assert_eq!(ctx.reactor.registered(), 0);
    }

    #[test]
    fn test_second_connect_while_pending() {
        let ctx = ctx();
        let stalled = StalledListener::new();

        let mut tcp = VirtualSocket::new(3, SocketKind::Tcp);
        let mut out = Vec::new();
        tcp.connect(&ctx, &[127, 0, 0, 1], stalled.port(), &mut out).unwrap();
        assert_eq!(tcp.state(), SocketState::Connecting);
        assert!(matches!(
            tcp.connect(&ctx, &[127, 0, 0, 1], stalled.port(), &mut out),
            Err(RelayError::AlreadyConnecting(3))
        ));
        assert!(out.is_empty());
        assert_eq!(ctx.reactor.registered(), 1);
    }

    #[test]
    fn test_send_while_connecting_is_queued() {
        let ctx = ctx();
        let mut stalled = StalledListener::new();

        let mut tcp = VirtualSocket::new(4, SocketKind::Tcp);
        let mut out = Vec::new();
        tcp.connect(&ctx, &[127, 0, 0, 1], stalled.port(), &mut out).unwrap();
        assert_eq!(tcp.state(), SocketState::Connecting);
        tcp.send(&ctx, b"early").unwrap();
        assert_eq!(tcp.queued(), 5);

        // Nothing is reported while the handshake is held back.
        ctx.reactor.poll_once(WAIT).unwrap();
        assert!(ctx.mailbox.pop().is_none());
        assert_eq!(tcp.queued(), 5);

        // Connect completion flushes the queue in the same pass.
        stalled.release();
        pump(&ctx, &mut tcp, &mut out, |o| !o.is_empty());
        assert_eq!(out, vec![Event::Connected { socket_id: 4, success: true }]);
        assert_eq!(tcp.queued(), 0);

        let mut accepted = stalled.accept();
        let mut buf = [0u8; 5];
        std::io::Read::read_exact(&mut accepted, &mut buf).unwrap();
        assert_eq!(&buf, b"early");
    }

    #[test]
    fn test_send_queue_limit_while_connecting() {
        let ctx = ctx_with(RelayConfig::new().send_queue_limit(4));
        let stalled = StalledListener::new();

        let mut tcp = VirtualSocket::new(5, SocketKind::Tcp);
        let mut out = Vec::new();
        tcp.connect(&ctx, &[127, 0, 0, 1], stalled.port(), &mut out).unwrap();
        assert_eq!(tcp.state(), SocketState::Connecting);

        assert!(matches!(
            tcp.send(&ctx, b"too long"),
            Err(RelayError::Backpressure { socket: 5, queued: 0, limit: 4 })
        ));
        assert_eq!(tcp.queued(), 0);

        tcp.send(&ctx, b"abcd").unwrap();
        assert_eq!(tcp.queued(), 4);
        assert!(matches!(
            tcp.send(&ctx, b"e"),
            Err(RelayError::Backpressure { socket: 5, queued: 4, limit: 4 })
        ));
        assert_eq!(tcp.queued(), 4);
        assert_eq!(tcp.state(), SocketState::Connecting);
    }

    #[test]
    fn test_send_queue_limit_against_idle_reader() {
        const LIMIT: usize = 64 * 1024;
        let ctx = ctx_with(RelayConfig::new().send_queue_limit(LIMIT));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut tcp = VirtualSocket::new(5, SocketKind::Tcp);
        let mut out = Vec::new();
        tcp.connect(&ctx, &[127, 0, 0, 1], port, &mut out).unwrap();
        pump(&ctx, &mut tcp, &mut out, |o| !o.is_empty());
        assert_eq!(out, vec![Event::Connected { socket_id: 5, success: true }]);
        // Accepted and never read, so the kernel buffers fill up.
        let (_peer, _) = listener.accept().unwrap();

        let chunk = vec![0x5a; LIMIT / 2];
        let mut rejected = None;
        for _ in 0..4096 {
            if let Err(e) = tcp.send(&ctx, &chunk) {
                rejected = Some(e);
                break;
            }
            assert!(tcp.queued() <= LIMIT);
        }
        assert!(matches!(
            rejected,
            Some(RelayError::Backpressure { socket: 5, limit: LIMIT, .. })
        ));
        assert!(tcp.queued() <= LIMIT);
        assert_eq!(tcp.state(), SocketState::Connected);
    }

    #[test]
    fn test_expire_connect() {
        let ctx = ctx();
        let stalled = StalledListener::new();

        let mut tcp = VirtualSocket::new(6, SocketKind::Tcp);
        let mut out = Vec::new();
        tcp.connect(&ctx, &[127, 0, 0, 1], stalled.port(), &mut out).unwrap();
        assert_eq!(tcp.state(), SocketState::Connecting);
        assert_eq!(ctx.reactor.registered(), 1);

        let now = Instant::now();
        let timeout = Duration::from_secs(60);
        assert!(!tcp.expire_connect(&ctx, now, timeout, &mut out));
        assert!(out.is_empty());
        assert!(tcp.expire_connect(&ctx, now + Duration::from_secs(61), timeout, &mut out));
        assert_eq!(out, vec![Event::Connected { socket_id: 6, success: false }]);
        assert!(tcp.is_closed());
        assert_eq!(ctx.reactor.registered(), 0);

        // Already failed; a second expiry reports nothing.
        assert!(!tcp.expire_connect(&ctx, now + Duration::from_secs(120), timeout, &mut out));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let ctx = ctx();
        let peer = udp_peer();
        let port = peer.local_addr().unwrap().port();

        let mut udp = VirtualSocket::new(1, SocketKind::Udp);
        udp.sendto(&ctx, &[127, 0, 0, 1], port, b"x").unwrap();
        assert_eq!(ctx.reactor.registered(), 1);

        udp.close(&ctx);
        udp.close(&ctx);
        assert!(udp.is_closed());
        assert!(udp.token().is_none());
        assert_eq!(ctx.reactor.registered(), 0);

        // Readiness after close is ignored.
        let mut out = Vec::new();
        udp.handle_ready(&ctx, Interest::READ | Interest::HANGUP, &mut out);
        assert!(out.is_empty());
    }
}
