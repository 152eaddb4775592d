//! Live connection tracker

use dashmap::DashMap;
use std::sync::Arc;

use cs_core::types::SessionHandle;

use crate::session::{Role, ServerSession};

/// Authenticated sessions, indexed by handle
pub struct ConnectionTracker {
    sessions: DashMap<SessionHandle, Arc<ServerSession>>,
}

impl ConnectionTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Start tracking a session
    pub fn add(&self, session: Arc<ServerSession>) {
        tracing::debug!("Tracking {} ({:?})", session.handle(), session.role());
        self.sessions.insert(session.handle(), session);
    }

    /// Stop tracking a session
    pub fn remove(&self, handle: SessionHandle) -> Option<Arc<ServerSession>> {
        self.sessions.remove(&handle).map(|(_, session)| session)
    }

    /// Get a session by handle
    pub fn get(&self, handle: SessionHandle) -> Option<Arc<ServerSession>> {
        self.sessions.get(&handle).map(|r| Arc::clone(&r))
    }

    fn with_role(&self, role: Role) -> Vec<Arc<ServerSession>> {
        self.sessions
            .iter()
            .filter(|r| r.role() == Some(role))
            .map(|r| Arc::clone(&r))
            .collect()
    }

    /// Connected terminal daemons
    pub fn clients(&self) -> Vec<Arc<ServerSession>> {
        self.with_role(Role::Client)
    }

    /// Connected admin consoles
    pub fn admins(&self) -> Vec<Arc<ServerSession>> {
        self.with_role(Role::Admin)
    }

    /// Number of tracked sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn authenticated(role: Role) -> Arc<ServerSession> {
        let session = ServerSession::new("127.0.0.1:1".parse().unwrap(), Duration::from_secs(1));
        session.set_role(role);
        Arc::new(session)
    }

    #[test]
    fn test_sessions_by_role() {
        let tracker = ConnectionTracker::new();
        let client = authenticated(Role::Client);
        let admin = authenticated(Role::Admin);
        tracker.add(Arc::clone(&client));
        tracker.add(Arc::clone(&admin));
        tracker.add(authenticated(Role::Client));

        assert_eq!(tracker.len(), 3);
        assert_eq!(tracker.clients().len(), 2);
        assert_eq!(tracker.admins()[0].handle(), admin.handle());

        assert!(tracker.remove(client.handle()).is_some());
        assert!(tracker.remove(client.handle()).is_none());
        assert!(tracker.get(client.handle()).is_none());
        assert_eq!(tracker.clients().len(), 1);
    }
}
