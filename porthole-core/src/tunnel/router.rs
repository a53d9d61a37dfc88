//! Public port allocation and routing
//!
//! Maps each allocated public port to the session that owns it. Ports are
//! handed out monotonically from the configured start port and never reused
//! within a process lifetime; a session stores only its assigned port, so
//! there is no reference cycle back from the session.

use crate::tunnel::session::Session;
use dashmap::DashMap;
use porthole_common::{Result, TunnelError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct Router {
    sessions: Arc<DashMap<u16, Session>>,
    next_port: Arc<AtomicU32>,
}

impl Router {
    #[must_use]
    pub fn new(start_port: u16) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            next_port: Arc::new(AtomicU32::new(u32::from(start_port))),
        }
    }

    /// Assign the next free public port to `session` and record the binding.
    pub fn allocate_port(&self, session: Session) -> Result<u16> {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let port = u16::try_from(port)
            .map_err(|_| TunnelError::InvalidState("public port space exhausted".into()))?;

        session.set_public_port(port);
        self.sessions.insert(port, session);
        Ok(port)
    }

    /// The session owning `port`, if any.
    #[must_use]
    pub fn get(&self, port: u16) -> Option<Session> {
        self.sessions.get(&port).map(|entry| entry.value().clone())
    }

    /// Evict the binding for `port`.
    pub fn remove(&self, port: u16) -> Option<Session> {
        self.sessions.remove(&port).map(|(_, session)| session)
    }

    /// Close every session and clear the table. Used at server shutdown.
    pub async fn close_all(&self) {
        let sessions: Vec<(u16, Session)> = self
            .sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        self.sessions.clear();

        info!("closing {} active sessions", sessions.len());
        for (port, session) in sessions {
            session.close().await;
            info!("closed session on port {port}");
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("sessions", &self.sessions.len())
            .field("next_port", &self.next_port.load(Ordering::Relaxed))
            .finish()
    }
}
