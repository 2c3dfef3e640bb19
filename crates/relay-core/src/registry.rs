//! Connection registry.
//!
//! The transport registers a session when a client connects and holds the
//! returned [`SessionLease`] for as long as the connection lives. The
//! broadcaster only ever reads a [`snapshot`](ConnectionRegistry::snapshot).

use crate::session::{Session, SessionId};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

/// The live set of client sessions.
pub struct ConnectionRegistry {
    /// Sessions indexed by ID.
    sessions: DashMap<SessionId, Arc<dyn Session>>,
    /// Outstanding leases, including sessions already removed by `close_all`.
    leases: AtomicUsize,
    /// Signalled when the last lease is dropped.
    idle: Notify,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            leases: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    /// Register a session.
    ///
    /// The session stays registered until the returned lease is dropped or
    /// [`close_all`](Self::close_all) is called.
    #[must_use = "dropping the lease unregisters the session"]
    pub fn register(self: &Arc<Self>, session: Arc<dyn Session>) -> SessionLease {
        let id = session.id().clone();
        self.leases.fetch_add(1, Ordering::SeqCst);
        self.sessions.insert(id.clone(), session);

        debug!(session = %id, sessions = self.sessions.len(), "Session registered");

        SessionLease {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Copy the current set of sessions.
    ///
    /// Sessions that disconnect after the snapshot is taken simply fail
    /// their delivery.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<dyn Session>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if no sessions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Check if a session is registered.
    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Drop every registered session.
    ///
    /// For queue-backed sessions this closes the queue, which lets each
    /// writer flush what it already has and then end the connection.
    /// Returns the number of sessions removed.
    pub fn close_all(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for id in ids {
            if self.sessions.remove(&id).is_some() {
                closed += 1;
            }
        }
        info!(sessions = closed, "Closed all sessions");
        closed
    }

    /// Number of leases still held by the transport.
    #[must_use]
    pub fn outstanding_leases(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    /// Wait until every lease has been dropped.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.leases.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn release(&self, id: &SessionId) {
        self.sessions.remove(id);
        if self.leases.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
        debug!(session = %id, sessions = self.sessions.len(), "Session unregistered");
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration handle held by the transport for one session.
pub struct SessionLease {
    registry: Arc<ConnectionRegistry>,
    id: SessionId,
}

impl SessionLease {
    /// The leased session's ID.
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.registry.release(&self.id);
    }
}
