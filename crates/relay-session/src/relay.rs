//! Composition root: one reactor thread shared by every session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use relay_core::{RelayConfig, Result, SessionId};
use relay_reactor::{Mailbox, Reactor, ReactorConfig};
use tracing::info;

use crate::session::{Session, Writer};

/// Hands out process-unique session ids, starting at 1.
#[derive(Debug, Default)]
pub struct SessionIdAllocator(AtomicU64);

impl SessionIdAllocator {
    pub fn next(&self) -> SessionId {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

pub struct Relay {
    reactor: Reactor,
    ids: SessionIdAllocator,
    config: Arc<RelayConfig>,
}

impl Relay {
    /// Start the reactor thread.
    pub fn start(config: RelayConfig) -> Result<Self> {
        let reactor = Reactor::start(ReactorConfig::from(&config))?;
        info!(
            poll_interval = ?config.poll_interval,
            max_sockets = config.max_sockets,
            "relay started"
        );
        Ok(Self {
            reactor,
            ids: SessionIdAllocator::default(),
            config: Arc::new(config),
        })
    }

    /// New session for a freshly accepted client. `wake` runs on the
    /// reactor thread whenever readiness is posted for this session.
    pub fn open_session(
        &self,
        writer: impl Writer + 'static,
        wake: impl Fn() + Send + Sync + 'static,
    ) -> Session {
        let mailbox = Arc::new(Mailbox::new(self.config.mailbox_capacity, wake));
        let session = Session::new(
            self.ids.next(),
            self.reactor.shared(),
            mailbox,
            self.config.clone(),
            writer,
        );
        session.on_open();
        session
    }

    pub fn shutdown(&mut self) {
        self.reactor.shutdown();
        info!("relay stopped");
    }
}
