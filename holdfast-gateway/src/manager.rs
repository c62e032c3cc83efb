//! Process-wide registry of live connections and their sessions.
//!
//! Three maps live under a single mutex so the connection index and the
//! two session indexes always mutate atomically: session-to-connection
//! and connection-to-session are mutual inverses, and every id mentioned
//! in either is a live key of the connection map while the lock is held.
//!
//! The mutex is a leaf: no send, I/O, or other lock acquisition ever
//! happens while it is held.

use crate::handler::{ConnectionHandler, ConnectionId, SessionId};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, trace};

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Arc<ConnectionHandler>>,
    session_to_conn: HashMap<SessionId, ConnectionId>,
    conn_to_session: HashMap<ConnectionId, SessionId>,
}

/// Registry of live connections indexed by connection id and, after logon,
/// session id.
///
/// Lookups hand out shared references that keep the handler alive even if
/// it is unregistered concurrently.
#[derive(Default)]
pub struct ConnectionManager {
    inner: Mutex<Registry>,
}

impl ConnectionManager {
    /// Create a fresh, empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Process-wide default instance, created lazily.
    ///
    /// Production wiring uses this; tests should create their own
    /// instances with [`new`](ConnectionManager::new).
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<ConnectionManager>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(Self::new))
    }

    /// Store the owning reference for `id`.
    ///
    /// Must be called exactly once per connection id; a duplicate
    /// registration is a programmer error asserted in debug builds.
    pub fn register(&self, id: ConnectionId, handler: Arc<ConnectionHandler>) {
        let mut reg = self.inner.lock();
        let previous = reg.connections.insert(id, handler);
        debug_assert!(previous.is_none(), "connection id {id} registered twice");
        drop(reg);
        debug!(connection = %id, "registered connection");
    }

    /// Drop any session binding involving `id` and remove the handler.
    ///
    /// The last shared reference is released after the lock, so handler
    /// destruction never runs under it.
    pub fn unregister(&self, id: ConnectionId) {
        let removed = {
            let mut reg = self.inner.lock();
            if let Some(session) = reg.conn_to_session.remove(&id) {
                reg.session_to_conn.remove(&session);
            }
            reg.connections.remove(&id)
        };
        if removed.is_some() {
            debug!(connection = %id, "unregistered connection");
        }
        drop(removed);
    }

    /// Bind `session` one-to-one to `id`.
    ///
    /// A previous session of this connection is unbound first; a previous
    /// connection of this session loses its binding. Re-binding the same
    /// pair is a no-op, as is binding to an unknown connection.
    pub fn set_session(&self, id: ConnectionId, session: SessionId) {
        let mut reg = self.inner.lock();
        if !reg.connections.contains_key(&id) {
            drop(reg);
            debug!(connection = %id, session = %session, "ignoring session bind for unknown connection");
            return;
        }
        if reg.conn_to_session.get(&id) == Some(&session) {
            return;
        }
        if let Some(old) = reg.conn_to_session.remove(&id) {
            reg.session_to_conn.remove(&old);
        }
        if let Some(previous) = reg.session_to_conn.insert(session, id) {
            reg.conn_to_session.remove(&previous);
        }
        reg.conn_to_session.insert(id, session);
        drop(reg);
        debug!(connection = %id, session = %session, "bound session");
    }

    /// Shared reference to the handler for `id`, if registered.
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<ConnectionHandler>> {
        self.inner.lock().connections.get(&id).cloned()
    }

    /// Shared reference to the handler bound to `session`, if any.
    #[must_use]
    pub fn connection_by_session(&self, session: SessionId) -> Option<Arc<ConnectionHandler>> {
        let reg = self.inner.lock();
        let id = reg.session_to_conn.get(&session)?;
        reg.connections.get(id).cloned()
    }

    /// The session currently bound to `id`, if any.
    #[must_use]
    pub fn session_of(&self, id: ConnectionId) -> Option<SessionId> {
        self.inner.lock().conn_to_session.get(&id).copied()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Whether no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send `bytes` to one connection. Unknown ids are a silent no-op.
    ///
    /// The registry lock is released before the send.
    pub fn send_to_connection(&self, id: ConnectionId, bytes: Bytes) {
        match self.connection(id) {
            Some(handler) => handler.send(bytes),
            None => trace!(connection = %id, "dropping send to unknown connection"),
        }
    }

    /// Send `bytes` to the connection bound to `session`. A missing
    /// binding is a silent no-op.
    pub fn send_to_session(&self, session: SessionId, bytes: Bytes) {
        let target = self.inner.lock().session_to_conn.get(&session).copied();
        match target {
            Some(id) => self.send_to_connection(id, bytes),
            None => trace!(session = %session, "no connection bound to session"),
        }
    }

    /// Send `bytes` to every registered connection.
    ///
    /// The connection set is snapshotted under the lock; every send
    /// happens strictly after its release.
    pub fn broadcast(&self, bytes: Bytes) {
        let handlers: Vec<_> = self.inner.lock().connections.values().cloned().collect();
        trace!(connections = handlers.len(), "broadcasting payload");
        for handler in &handlers {
            handler.send(bytes.clone());
        }
    }

    /// Verify the dual-index invariants; test builds only.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let reg = self.inner.lock();
        assert_eq!(reg.session_to_conn.len(), reg.conn_to_session.len());
        for (session, id) in &reg.session_to_conn {
            assert_eq!(reg.conn_to_session.get(id), Some(session));
            assert!(reg.connections.contains_key(id));
        }
        for (id, session) in &reg.conn_to_session {
            assert_eq!(reg.session_to_conn.get(session), Some(id));
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reg = self.inner.lock();
        f.debug_struct("ConnectionManager")
            .field("connections", &reg.connections.len())
            .field("sessions", &reg.session_to_conn.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Service;
    use holdfast_core::WorkerPool;
    use std::sync::Weak;
    use tokio::sync::mpsc;

    struct NoopService;

    impl Service for NoopService {
        fn handle(&self, _conn: &Arc<ConnectionHandler>, _payload: Bytes) {}
    }

    fn test_handler(id: u64) -> (Arc<ConnectionHandler>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = ConnectionHandler::new(
            ConnectionId::new(id),
            "127.0.0.1:0".parse().unwrap(),
            tx,
            Arc::new(NoopService),
            Arc::new(WorkerPool::new(1)),
            Weak::new(),
        );
        (handler, rx)
    }

    #[tokio::test]
    async fn test_register_lookup_unregister() {
        let manager = ConnectionManager::new();
        let (handler, _rx) = test_handler(100);
        let id = handler.id();

        manager.register(id, Arc::clone(&handler));
        assert_eq!(manager.len(), 1);
        assert!(manager.connection(id).is_some());

        manager.unregister(id);
        assert!(manager.connection(id).is_none());
        assert!(manager.is_empty());
        manager.assert_invariants();
    }

    #[tokio::test]
    async fn test_send_after_unregister_is_a_noop() {
        let manager = ConnectionManager::new();
        let (handler, mut rx) = test_handler(100);
        let id = handler.id();

        manager.register(id, handler);
        manager.unregister(id);
        manager.send_to_connection(id, Bytes::from_static(b"X"));

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_session_rebinding_is_destructive() {
        let manager = ConnectionManager::new();
        let (h1, _rx1) = test_handler(100);
        let (h2, _rx2) = test_handler(101);
        manager.register(h1.id(), Arc::clone(&h1));
        manager.register(h2.id(), Arc::clone(&h2));

        let session = SessionId::new(5000);
        manager.set_session(h1.id(), session);
        manager.assert_invariants();
        manager.set_session(h2.id(), session);
        manager.assert_invariants();

        let bound = manager.connection_by_session(session).unwrap();
        assert_eq!(bound.id(), h2.id());
        assert_eq!(manager.session_of(h1.id()), None);
        assert_eq!(manager.session_of(h2.id()), Some(session));
    }

    #[tokio::test]
    async fn test_rebinding_connection_to_new_session_unbinds_old() {
        let manager = ConnectionManager::new();
        let (handler, _rx) = test_handler(100);
        let id = handler.id();
        manager.register(id, handler);

        manager.set_session(id, SessionId::new(1));
        manager.set_session(id, SessionId::new(2));
        manager.assert_invariants();

        assert!(manager.connection_by_session(SessionId::new(1)).is_none());
        assert_eq!(manager.session_of(id), Some(SessionId::new(2)));
    }

    #[tokio::test]
    async fn test_same_pair_rebinding_is_idempotent() {
        let manager = ConnectionManager::new();
        let (handler, _rx) = test_handler(100);
        let id = handler.id();
        manager.register(id, handler);

        manager.set_session(id, SessionId::new(7));
        manager.set_session(id, SessionId::new(7));
        manager.assert_invariants();

        assert_eq!(manager.session_of(id), Some(SessionId::new(7)));
        assert_eq!(manager.connection_by_session(SessionId::new(7)).unwrap().id(), id);
    }

    #[tokio::test]
    async fn test_binding_unknown_connection_is_a_noop() {
        let manager = ConnectionManager::new();
        manager.set_session(ConnectionId::new(404), SessionId::new(1));
        manager.assert_invariants();
        assert!(manager.connection_by_session(SessionId::new(1)).is_none());
    }

    #[tokio::test]
    async fn test_unregister_drops_session_binding() {
        let manager = ConnectionManager::new();
        let (handler, _rx) = test_handler(100);
        let id = handler.id();
        manager.register(id, handler);
        manager.set_session(id, SessionId::new(9));

        manager.unregister(id);
        manager.assert_invariants();
        assert!(manager.connection_by_session(SessionId::new(9)).is_none());
        manager.send_to_session(SessionId::new(9), Bytes::from_static(b"X"));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_connection() {
        let manager = ConnectionManager::new();
        let mut receivers = Vec::new();
        for id in [1, 2, 3] {
            let (handler, rx) = test_handler(id);
            manager.register(handler.id(), Arc::clone(&handler));
            receivers.push(rx);
        }

        manager.broadcast(Bytes::from_static(b"X"));

        for rx in &mut receivers {
            assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"X"));
        }
    }

    #[tokio::test]
    async fn test_lookup_keeps_handler_alive_across_unregister() {
        let manager = ConnectionManager::new();
        let (handler, mut rx) = test_handler(100);
        let id = handler.id();
        manager.register(id, handler);

        let held = manager.connection(id).unwrap();
        manager.unregister(id);

        // The held reference still works even though the registry forgot it.
        held.send(Bytes::from_static(b"still alive"));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"still alive"));
    }
}
