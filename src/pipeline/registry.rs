//! Client session registry
//!
//! Maps a client identifier to its isolated session. The session id is the
//! index; `ClientSession` is the arena entry. Structural changes take the
//! write lock, lookups the read lock, and no registry lock is ever held
//! while a session talks to the backend.

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

use crate::error::{ProxyError, Result};
use crate::pipeline::frame_buffer::ReorderConfig;
use crate::pipeline::session::ClientSession;

pub struct ClientSessionRegistry {
    sessions: RwLock<HashMap<String, Arc<ClientSession>>>,
    reorder: ReorderConfig,
}

impl ClientSessionRegistry {
    pub fn new(reorder: ReorderConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            reorder,
        }
    }

    /// Create a session with a fresh identifier
    ///
    /// The session is fully constructed before it becomes visible.
    pub fn register(&self) -> Arc<ClientSession> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        let id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        let session = Arc::new(ClientSession::new(id.clone(), self.reorder));
        sessions.insert(id.clone(), Arc::clone(&session));
        debug!("Registry: registered {} ({} live)", id, sessions.len());
        session
    }

    pub fn lookup(&self, session_id: &str) -> Result<Arc<ClientSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
            .ok_or_else(|| ProxyError::UnknownSession(session_id.to_string()))
    }

    /// Remove a session; unknown ids are reported, not fatal
    pub fn unregister(&self, session_id: &str) -> Option<Arc<ClientSession>> {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);

        if removed.is_none() {
            warn!("Registry: unregister of unknown session {}", session_id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

impl Default for ClientSessionRegistry {
    fn default() -> Self {
        Self::new(ReorderConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_register_lookup_unregister() {
        let registry = ClientSessionRegistry::default();
        let session = registry.register();

        let found = registry.lookup(session.id()).unwrap();
        assert!(Arc::ptr_eq(&session, &found));
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(session.id()).is_some());
        assert!(registry.is_empty());
        assert!(matches!(
            registry.lookup(session.id()),
            Err(ProxyError::UnknownSession(_))
        ));
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = ClientSessionRegistry::default();
        let session = registry.register();

        assert!(registry.unregister(session.id()).is_some());
        assert!(registry.unregister(session.id()).is_none());
        assert!(registry.unregister("never-registered").is_none());
    }

    #[test]
    fn test_concurrent_registration_yields_unique_ids() {
        let registry = Arc::new(ClientSessionRegistry::default());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    (0..25)
                        .map(|_| registry.register().id().to_string())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let ids: HashSet<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(ids.len(), 200);
        assert_eq!(registry.len(), 200);
    }

    #[test]
    fn test_sessions_use_configured_depth() {
        let registry = ClientSessionRegistry::new(ReorderConfig { depth: 3 });
        let session = registry.register();
        assert_eq!(session.lock().frames.depth(), 3);
    }
}
