//! Raw non-blocking IPv4 socket calls.
//!
//! Thin `libc` wrappers returning `Errno`; every descriptor is created
//! `SOCK_NONBLOCK | SOCK_CLOEXEC` and owned by an `OwnedFd`.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use nix::errno::Errno;
use relay_core::SocketKind;

pub type SysResult<T> = std::result::Result<T, Errno>;

/// Outcome of a non-blocking `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Connected,
    InProgress,
}

fn sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.ip().octets()),
    };
    sa
}

const SOCKADDR_IN_LEN: libc::socklen_t = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

/// Create a non-blocking socket of the given kind.
pub fn open(kind: SocketKind) -> SysResult<OwnedFd> {
    let ty = match kind {
        SocketKind::Tcp => libc::SOCK_STREAM,
        SocketKind::Udp => libc::SOCK_DGRAM,
    };
    let fd = unsafe { libc::socket(libc::AF_INET, ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(Errno::last());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// SO_REUSEADDR, so a fixed local port can be taken again right after close.
pub fn set_reuse_addr(fd: &OwnedFd) -> SysResult<()> {
    let opt: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(Errno::last());
    }
    Ok(())
}

/// Bind to INADDR_ANY:`port`; port 0 picks an ephemeral one.
pub fn bind_any(fd: &OwnedFd, port: u16) -> SysResult<()> {
    let sa = sockaddr_in(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &sa as *const _ as *const libc::sockaddr,
            SOCKADDR_IN_LEN,
        )
    };
    if rc != 0 {
        return Err(Errno::last());
    }
    Ok(())
}

/// Local port the socket ended up bound to.
pub fn local_port(fd: &OwnedFd) -> SysResult<u16> {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = SOCKADDR_IN_LEN;
    let rc = unsafe {
        libc::getsockname(
            fd.as_raw_fd(),
            &mut sa as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(Errno::last());
    }
    Ok(u16::from_be(sa.sin_port))
}

pub fn connect(fd: &OwnedFd, addr: SocketAddrV4) -> SysResult<ConnectStatus> {
    let sa = sockaddr_in(addr);
    let rc = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &sa as *const _ as *const libc::sockaddr,
            SOCKADDR_IN_LEN,
        )
    };
    if rc == 0 {
        return Ok(ConnectStatus::Connected);
    }
    match Errno::last() {
        Errno::EINPROGRESS | Errno::EALREADY => Ok(ConnectStatus::InProgress),
        e => Err(e),
    }
}

/// Pending socket error (`SO_ERROR`), cleared by the read.
pub fn take_error(fd: &OwnedFd) -> SysResult<Option<Errno>> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(Errno::last());
    }
    Ok((err != 0).then(|| Errno::from_raw(err)))
}

/// Single non-blocking send on a connected stream. Never raises SIGPIPE.
pub fn send(fd: &OwnedFd, buf: &[u8]) -> SysResult<usize> {
    let n = unsafe {
        libc::send(
            fd.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT,
        )
    };
    if n < 0 {
        return Err(Errno::last());
    }
    Ok(n as usize)
}

pub fn send_to(fd: &OwnedFd, buf: &[u8], addr: SocketAddrV4) -> SysResult<usize> {
    let sa = sockaddr_in(addr);
    let n = unsafe {
        libc::sendto(
            fd.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
            &sa as *const _ as *const libc::sockaddr,
            SOCKADDR_IN_LEN,
        )
    };
    if n < 0 {
        return Err(Errno::last());
    }
    Ok(n as usize)
}

pub fn recv(fd: &OwnedFd, buf: &mut [u8]) -> SysResult<usize> {
    let n = unsafe {
        libc::recv(
            fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
        )
    };
    if n < 0 {
        return Err(Errno::last());
    }
    Ok(n as usize)
}

#[inline]
pub fn would_block(e: Errno) -> bool {
    e == Errno::EAGAIN || e == Errno::EWOULDBLOCK || e == Errno::EINTR
}
