//! Live session registry
//!
//! Every tunnel session registers a [`SessionHandle`] under the id of the
//! server it uses, so all sessions of a server can be closed at once.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Close signal shared between a session and whoever may close it
#[derive(Debug, Default)]
pub struct SessionHandle {
    closing: AtomicBool,
    notify: Notify,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the session to close; only the first call returns `true`
    pub fn close(&self) -> bool {
        let first = !self.closing.swap(true, Ordering::AcqRel);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Resolves once `close` has been called
    pub async fn closed(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// Sessions grouped by server id
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: Mutex<HashMap<String, HashMap<u64, Arc<SessionHandle>>>>,
    next_id: AtomicU64,
}

/// Registration that removes itself when dropped
pub struct SessionGuard {
    registry: Arc<ConnectionRegistry>,
    server_id: String,
    key: u64,
    handle: Arc<SessionHandle>,
}

impl SessionGuard {
    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.server_id, self.key);
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under a server
    pub fn register(self: &Arc<Self>, server_id: &str, handle: Arc<SessionHandle>) -> SessionGuard {
        let key = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions
            .lock()
            .entry(server_id.to_string())
            .or_default()
            .insert(key, handle.clone());
        SessionGuard {
            registry: self.clone(),
            server_id: server_id.to_string(),
            key,
            handle,
        }
    }

    fn unregister(&self, server_id: &str, key: u64) {
        let mut sessions = self.sessions.lock();
        if let Some(set) = sessions.get_mut(server_id) {
            set.remove(&key);
            if set.is_empty() {
                sessions.remove(server_id);
            }
        }
    }

    /// Live sessions on a server
    pub fn count(&self, server_id: &str) -> usize {
        self.sessions
            .lock()
            .get(server_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Close every session on a server; returns how many were signalled
    pub fn close_server(&self, server_id: &str) -> usize {
        let handles: Vec<Arc<SessionHandle>> = self
            .sessions
            .lock()
            .get(server_id)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default();
        handles.iter().filter(|h| h.close()).count()
    }

    /// Close every registered session
    pub fn close_all(&self) -> usize {
        let handles: Vec<Arc<SessionHandle>> = self
            .sessions
            .lock()
            .values()
            .flat_map(|s| s.values().cloned())
            .collect();
        handles.iter().filter(|h| h.close()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_close_is_idempotent() {
        let handle = SessionHandle::new();
        assert!(handle.close());
        assert!(!handle.close());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_closed_wakes_waiter() {
        let handle = Arc::new(SessionHandle::new());
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.closed().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        // Already closed: returns immediately
        handle.closed().await;
    }

    #[test]
    fn test_registry_groups_by_server() {
        let registry = Arc::new(ConnectionRegistry::new());
        let a1 = registry.register("a", Arc::new(SessionHandle::new()));
        let a2 = registry.register("a", Arc::new(SessionHandle::new()));
        let b1 = registry.register("b", Arc::new(SessionHandle::new()));
        assert_eq!(registry.count("a"), 2);

        assert_eq!(registry.close_server("a"), 2);
        assert!(a1.handle().is_closed());
        assert!(a2.handle().is_closed());
        assert!(!b1.handle().is_closed());
        assert_eq!(registry.close_server("a"), 0);

        drop(a1);
        assert_eq!(registry.count("a"), 1);
        assert_eq!(registry.close_all(), 1);
        drop(a2);
        drop(b1);
        assert_eq!(registry.count("a"), 0);
        assert_eq!(registry.count("b"), 0);
    }
}
