//! Loopback fixtures shared by the unit tests.

use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use relay_core::SocketKind;

use crate::sys;

pub(crate) const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// A TCP listener with a backlog of one whose accept queue is already full.
///
/// The kernel drops SYNs to a full accept queue, so any connect aimed at
/// `port()` stays in progress until `release` drains the queue and the
/// client's SYN retry (about a second later) gets through.
pub(crate) struct StalledListener {
    listener: OwnedFd,
    fillers: Vec<OwnedFd>,
    port: u16,
}

impl StalledListener {
    pub(crate) fn new() -> Self {
        let listener = sys::open(SocketKind::Tcp).unwrap();
        sys::bind_any(&listener, 0).unwrap();
        assert_eq!(unsafe { libc::listen(listener.as_raw_fd(), 1) }, 0);
        let port = sys::local_port(&listener).unwrap();

        let dest = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        let fillers = (0..3)
            .map(|_| {
                let fd = sys::open(SocketKind::Tcp).unwrap();
                sys::connect(&fd, dest).unwrap();
                fd
            })
            .collect();
        std::thread::sleep(Duration::from_millis(50));
        Self { listener, fillers, port }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Abandon the fillers and empty the accept queue.
    pub(crate) fn release(&mut self) {
        self.fillers.clear();
        while self.try_accept().is_some() {}
    }

    /// Next accepted connection, as a blocking stream with a read timeout.
    pub(crate) fn accept(&self) -> TcpStream {
        let deadline = Instant::now() + IO_TIMEOUT;
        loop {
            if let Some(fd) = self.try_accept() {
                let stream = TcpStream::from(fd);
                stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
                return stream;
            }
            assert!(Instant::now() < deadline, "no connection arrived on port {}", self.port);
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn try_accept(&self) -> Option<OwnedFd> {
        let fd = unsafe {
            libc::accept4(
                self.listener.as_raw_fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            let e = Errno::last();
            assert!(sys::would_block(e), "accept failed: {e}");
            return None;
        }
        Some(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}
