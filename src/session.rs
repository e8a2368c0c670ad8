use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Identifier the transport assigns to a client connection
pub type ConnectionId = usize;

/// Key/value state that lives as long as one client connection
#[derive(Debug, Default)]
pub struct Session {
    values: Mutex<HashMap<String, String>>,
}

impl Session {
    pub fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.lock().contains_key(key)
    }

    pub fn set(&self, key: &str, value: &str) {
        self.values.lock().insert(key.to_string(), value.to_string());
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

/// Sessions of the currently open connections. The store holds the only
/// strong reference; requests hold weak ones, so closing a connection drops
/// its session even while a handler still has the request.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<ConnectionId, Arc<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session of `id`, if one was created
    pub fn get(&self, id: ConnectionId) -> Option<Weak<Session>> {
        self.sessions.lock().get(&id).map(Arc::downgrade)
    }

    /// Session of `id`, created on first use
    pub fn get_or_create(&self, id: ConnectionId) -> Weak<Session> {
        let mut sessions = self.sessions.lock();
        let session = sessions.entry(id).or_insert_with(|| {
            log::debug!("Creating session for connection {}", id);
            Arc::new(Session::default())
        });
        Arc::downgrade(session)
    }

    /// Drop the session of a closed connection
    pub fn remove(&self, id: ConnectionId) -> bool {
        self.sessions.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_created_lazily() {
        let store = SessionStore::new();
        assert!(store.get(7).is_none());

        let session = store.get_or_create(7);
        session.upgrade().unwrap().set("user", "alice");

        let again = store.get(7).unwrap().upgrade().unwrap();
        assert_eq!(again.get("user").as_deref(), Some("alice"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_removed_session_is_unreachable() {
        let store = SessionStore::new();
        let weak = store.get_or_create(1);
        assert!(store.remove(1));
        assert!(weak.upgrade().is_none());
        assert!(!store.remove(1));
    }

    #[test]
    fn test_sessions_are_per_connection() {
        let store = SessionStore::new();
        store.get_or_create(1).upgrade().unwrap().set("a", "1");
        let other = store.get_or_create(2).upgrade().unwrap();
        assert!(!other.contains("a"));
    }
}
