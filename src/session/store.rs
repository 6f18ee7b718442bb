use super::core::{AgentKind, Session};
use crate::ids::SessionId;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub(crate) type SessionMap = HashMap<SessionId, Arc<Session>>;

/// Identifier → session map.
///
/// A single lock covers the map. Per-session state has its own finer locks, so
/// holding a session never blocks an unrelated lookup.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<SessionMap>,
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-owning lookup.
    #[must_use]
    pub fn find(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.lock().get(id).cloned()
    }

    /// Look up or create without taking a reference.
    pub fn find_or_create(&self, id: &SessionId) -> Arc<Session> {
        let mut sessions = self.sessions.lock();
        Self::entry(&mut sessions, id)
    }

    /// Look up or create and take a reference, atomically with respect to GC.
    ///
    /// The reference is taken under the store lock, so a sweep can never
    /// delete the session between lookup and retain.
    pub fn checkout(&self, id: &SessionId, user_agent: Option<&str>) -> Arc<Session> {
        let mut sessions = self.sessions.lock();
        let session = Self::entry(&mut sessions, id);
        session.retain();
        if let Some(ua) = user_agent {
            if session.agent() == AgentKind::Unknown {
                session.set_agent(AgentKind::classify(ua));
            }
        }
        session
    }

    fn entry(sessions: &mut SessionMap, id: &SessionId) -> Arc<Session> {
        if let Some(existing) = sessions.get(id) {
            return Arc::clone(existing);
        }
        let session = Arc::new(Session::new(id.clone()));
        sessions.insert(id.clone(), Arc::clone(&session));
        debug!(session_id = %id, total_sessions = sessions.len(), "Session created");
        session
    }

    /// Remove a session unless it is busy or referenced.
    pub fn remove(&self, id: &SessionId) -> bool {
        let removed = {
            let mut sessions = self.sessions.lock();
            match sessions.get(id) {
                Some(s) if !s.is_pinned() => sessions.remove(id),
                _ => None,
            }
        };
        match removed {
            Some(session) => {
                crate::post::teardown(&session);
                debug!(session_id = %id, "Session removed");
                true
            }
            None => false,
        }
    }

    pub(crate) fn insert(&self, session: Arc<Session>) {
        self.sessions
            .lock()
            .insert(session.id().clone(), session);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of sessions currently in use.
    #[must_use]
    pub fn busy_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.is_pinned())
            .count()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionMap> {
        self.sessions.lock()
    }

    pub(crate) fn try_lock(&self, timeout: Duration) -> Option<MutexGuard<'_, SessionMap>> {
        self.sessions.try_lock_for(timeout)
    }

    /// Drop every session. Used at shutdown, regardless of references.
    pub fn clear(&self) -> usize {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock();
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in &drained {
            crate::post::teardown(session);
        }
        info!(sessions = drained.len(), "Session store cleared");
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SessionId {
        s.parse().unwrap()
    }

    #[test]
    fn test_find_is_case_insensitive() {
        let store = SessionStore::new();
        store.find_or_create(&sid("ABC"));
        assert!(store.find(&sid("abc")).is_some());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_checkout_retains_and_classifies() {
        let store = SessionStore::new();
        let s = store.checkout(&sid("x1"), Some("Googlebot/2.1"));
        assert_eq!(s.ref_count(), 1);
        assert_eq!(s.use_count(), 1);
        assert_eq!(s.agent(), AgentKind::Bot);
        let again = store.checkout(&sid("X1"), None);
        assert!(Arc::ptr_eq(&s, &again));
        assert_eq!(again.ref_count(), 2);
    }

    #[test]
    fn test_remove_honours_veto() {
        let store = SessionStore::new();
        let s = store.checkout(&sid("held"), None);
        assert!(!store.remove(&sid("held")));
        s.release();
        s.set_busy(true);
        assert!(!store.remove(&sid("held")));
        s.set_busy(false);
        assert!(store.remove(&sid("held")));
        assert!(store.find(&sid("held")).is_none());
    }

    #[test]
    fn test_clear_ignores_references() {
        let store = SessionStore::new();
        store.checkout(&sid("a"), None);
        store.find_or_create(&sid("b"));
        assert_eq!(store.clear(), 2);
        assert!(store.is_empty());
    }
}
