//! # Reactor: the epoll readiness poller
//!
//! The reactor runs on a dedicated OS thread. It:
//! 1. Waits on epoll for at most `poll_interval`
//! 2. Maps each ready descriptor to its registration (fd table)
//! 3. Drops readiness whose generation no longer matches (stale fd)
//! 4. Posts a `Readiness` to the owning session's mailbox
//!
//! Registration mutation (`register` / `modify_interest` / `unregister`)
//! happens on session threads under the table lock, so the table and the
//! epoll interest list never disagree.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use relay_core::{RelayConfig, RelayError, Result, SocketId};
use tracing::{debug, error, info, trace, warn};

use crate::interest::Interest;
use crate::mailbox::{Mailbox, Readiness};

/// Identity of one registration: descriptor plus generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

impl Token {
    pub fn new(fd: RawFd, generation: u32) -> Self {
        Token((u64::from(generation) << 32) | u64::from(fd as u32))
    }

    #[inline]
    pub fn fd(self) -> RawFd {
        (self.0 & 0xffff_ffff) as u32 as RawFd
    }

    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

/// Reactor configuration.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Upper bound on one epoll wait.
    pub poll_interval: Duration,
    /// Events taken per pass.
    pub max_events: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self::from(&RelayConfig::new())
    }
}

impl From<&RelayConfig> for ReactorConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            max_events: config.max_events,
        }
    }
}

struct Entry {
    token: Token,
    socket_id: SocketId,
    interest: Interest,
    mailbox: Arc<Mailbox>,
}

/// Shared state between the reactor thread and the sessions.
pub struct ReactorShared {
    epoll: OwnedFd,
    /// Registration table keyed by descriptor. Holds no socket ownership.
    table: Mutex<HashMap<RawFd, Entry>>,
    next_generation: AtomicU32,
    /// Shutdown signal.
    shutdown: AtomicBool,
    max_events: usize,
}

impl ReactorShared {
    pub fn new(config: &ReactorConfig) -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(RelayError::last_os("epoll_create1"));
        }
        Ok(Self {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            table: Mutex::new(HashMap::new()),
            next_generation: AtomicU32::new(1),
            shutdown: AtomicBool::new(false),
            max_events: config.max_events.max(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RawFd, Entry>> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, bits: u32, token: Token) -> std::result::Result<(), Errno> {
        let mut ev = libc::epoll_event { events: bits, u64: token.0 };
        let rc = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut ev) };
        if rc < 0 {
            return Err(Errno::last());
        }
        Ok(())
    }

    /// Start watching `fd` on behalf of `socket_id`; readiness goes to `mailbox`.
    pub fn register(
        &self,
        fd: RawFd,
        socket_id: SocketId,
        mailbox: &Arc<Mailbox>,
        interest: Interest,
    ) -> Result<Token> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = Token::new(fd, generation);

        let mut table = self.lock();
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest.to_epoll(), token)
            .map_err(|e| RelayError::os("epoll_ctl(ADD)", e))?;
        table.insert(
            fd,
            Entry {
                token,
                socket_id,
                interest,
                mailbox: mailbox.clone(),
            },
        );
        debug!(fd, socket = socket_id, generation, ?interest, "registered");
        Ok(token)
    }

    /// Replace the interest mask and re-arm the descriptor.
    pub fn modify_interest(&self, fd: RawFd, interest: Interest) -> Result<()> {
        let mut table = self.lock();
        let entry = table
            .get_mut(&fd)
            .ok_or(RelayError::os("epoll_ctl(MOD)", Errno::ENOENT))?;
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest.to_epoll(), entry.token)
            .map_err(|e| RelayError::os("epoll_ctl(MOD)", e))?;
        entry.interest = interest;
        trace!(fd, socket = entry.socket_id, ?interest, "re-armed");
        Ok(())
    }

    /// Stop watching `fd`. Must happen before the descriptor is closed.
    /// Unknown descriptors are a no-op.
    pub fn unregister(&self, fd: RawFd) -> Result<()> {
        let mut table = self.lock();
        let Some(entry) = table.remove(&fd) else {
            return Ok(());
        };
        match self.ctl(libc::EPOLL_CTL_DEL, fd, 0, entry.token) {
            Ok(()) | Err(Errno::ENOENT) | Err(Errno::EBADF) => {}
            Err(e) => return Err(RelayError::os("epoll_ctl(DEL)", e)),
        }
        debug!(fd, socket = entry.socket_id, "unregistered");
        Ok(())
    }

    /// Re-arm a registration whose event could not be delivered.
    fn rearm(&self, token: Token) {
        let table = self.lock();
        if let Some(entry) = table.get(&token.fd()).filter(|e| e.token == token) {
            if let Err(e) = self.ctl(libc::EPOLL_CTL_MOD, token.fd(), entry.interest.to_epoll(), token) {
                warn!(fd = token.fd(), error = %e, "re-arm after full mailbox failed");
            }
        }
    }

    /// Wait up to `timeout` and deliver every readiness observed.
    /// Returns the number of events posted to mailboxes.
    pub fn poll_once(&self, timeout: Duration) -> Result<usize> {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.max_events];
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;

        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let errno = Errno::last();
            if errno == Errno::EINTR {
                return Ok(0);
            }
            return Err(RelayError::os("epoll_wait", errno));
        }

        // Resolve under the lock, post outside it.
        let mut ready = Vec::with_capacity(n as usize);
        {
            let table = self.lock();
            for ev in &events[..n as usize] {
                let token = Token(ev.u64);
                let bits = ev.events;
                match table.get(&token.fd()) {
                    Some(entry) if entry.token == token => ready.push((
                        entry.mailbox.clone(),
                        Readiness {
                            socket_id: entry.socket_id,
                            token,
                            events: Interest::from_epoll(bits),
                        },
                    )),
                    _ => trace!(fd = token.fd(), generation = token.generation(), "stale readiness dropped"),
                }
            }
        }

        let mut delivered = 0;
        for (mailbox, readiness) in ready {
            match mailbox.post(readiness) {
                Ok(()) => delivered += 1,
                Err(rejected) => {
                    warn!(socket = rejected.socket_id, "mailbox full, readiness retried next pass");
                    self.rearm(rejected.token);
                }
            }
        }
        Ok(delivered)
    }

    /// Number of live registrations.
    pub fn registered(&self) -> usize {
        self.lock().len()
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.lock().contains_key(&fd)
    }
}

/// Handle to the reactor thread (held by the composition root).
pub struct Reactor {
    shared: Arc<ReactorShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Reactor {
    /// Create and start the reactor.
    pub fn start(config: ReactorConfig) -> Result<Self> {
        let shared = Arc::new(ReactorShared::new(&config)?);
        let shared_clone = shared.clone();
        let interval = config.poll_interval;

        let thread = thread::Builder::new()
            .name("relay-reactor".into())
            .spawn(move || reactor_loop(shared_clone, interval))
            .map_err(|e| RelayError::Spawn(e.to_string()))?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Get a handle to the shared state (for sessions to register sockets).
    pub fn shared(&self) -> Arc<ReactorShared> {
        self.shared.clone()
    }

    /// Stop polling and join the thread. Returns within one poll interval.
    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The reactor loop. Runs on a dedicated OS thread.
fn reactor_loop(shared: Arc<ReactorShared>, interval: Duration) {
    info!(?interval, "relay-reactor: started");

    while !shared.shutdown.load(Ordering::Acquire) {
        if let Err(e) = shared.poll_once(interval) {
            error!(error = %e, "relay-reactor: poll failed");
            thread::sleep(interval);
        }
    }

    info!(registered = shared.registered(), "relay-reactor: shutdown");
}
