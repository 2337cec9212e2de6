//! Per-session readiness mailbox.
//!
//! The reactor thread pushes, the owning session pops. The wake callback
//! tells the session's task that there is something to drain.

use crossbeam_queue::ArrayQueue;
use relay_core::SocketId;

use crate::interest::Interest;
use crate::reactor::Token;

/// One readiness notification for one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub socket_id: SocketId,
    pub token: Token,
    pub events: Interest,
}

pub struct Mailbox {
    queue: ArrayQueue<Readiness>,
    wake: Box<dyn Fn() + Send + Sync>,
}

impl Mailbox {
    pub fn new(capacity: usize, wake: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            wake: Box::new(wake),
        }
    }

    /// Mailbox whose owner polls it instead of being woken.
    pub fn polled(capacity: usize) -> Self {
        Self::new(capacity, || {})
    }

    /// Called by the reactor. Hands the event back when the queue is full.
    pub(crate) fn post(&self, event: Readiness) -> Result<(), Readiness> {
        self.queue.push(event)?;
        (self.wake)();
        Ok(())
    }

    pub fn pop(&self) -> Option<Readiness> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("pending", &self.queue.len())
            .field("capacity", &self.queue.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn event(socket_id: SocketId) -> Readiness {
        Readiness {
            socket_id,
            token: Token::new(3, 1),
            events: Interest::READ,
        }
    }

    #[test]
    fn test_post_wakes_and_preserves_order() {
        let wakes = Arc::new(AtomicUsize::new(0));
        let w = wakes.clone();
        let mb = Mailbox::new(4, move || {
            w.fetch_add(1, Ordering::SeqCst);
        });

        mb.post(event(1)).unwrap();
        mb.post(event(2)).unwrap();
        assert_eq!(wakes.load(Ordering::SeqCst), 2);
        assert_eq!(mb.len(), 2);
        assert_eq!(mb.pop().unwrap().socket_id, 1);
        assert_eq!(mb.pop().unwrap().socket_id, 2);
        assert!(mb.pop().is_none());
    }

    #[test]
    fn test_full_mailbox_returns_event() {
        let mb = Mailbox::polled(1);
        mb.post(event(1)).unwrap();
        let rejected = mb.post(event(2)).unwrap_err();
        assert_eq!(rejected.socket_id, 2);
        assert_eq!(mb.len(), 1);
    }
}
