//! Process-wide table of live sessions.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::inbound::Inbound;
use crate::session::{Session, SessionId};

pub(crate) type SessionMap = DashMap<SessionId, Arc<Session>>;

/// Concurrent map from session id to session.
///
/// Cloning is cheap; clones share the same table. Sessions remove
/// themselves when they shut down.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<SessionMap>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and registers a session under a fresh id.
    pub fn create_session(&self, inbound: Arc<dyn Inbound>) -> Arc<Session> {
        loop {
            let id = SessionId::generate();
            match self.sessions.entry(id.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    let session = Session::new(id, inbound, Arc::downgrade(&self.sessions));
                    slot.insert(session.clone());
                    debug!(session = %session.id(), "session created");
                    return session;
                }
            }
        }
    }

    /// Looks a session up by its wire id.
    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Removes a session; unknown ids are ignored.
    pub fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ids of all live sessions.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Disconnects every live session.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        info!(count = sessions.len(), "shutting down all sessions");
        for session in sessions {
            session.force_disconnect().await;
        }
        self.sessions.clear();
    }
}
