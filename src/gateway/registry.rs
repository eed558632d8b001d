use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::session::{Session, SessionState, SocketHandle};

/// Outcome of [`SessionRegistry::mark_streaming`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStart {
    Started,
    AlreadyStreaming,
    /// The session was removed, e.g. reclaimed by the reaper.
    Gone,
}

/// Authoritative store of live sessions, shared by every connection task and
/// the idle reaper. Each mutation runs under the map's lock for that key, so
/// a session's `state` and `last_activity_at` never see concurrent writers.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted socket and return its session id.
    pub fn register(&self, handle: SocketHandle) -> String {
        loop {
            let session_id = uuid::Uuid::new_v4().to_string();
            if let Entry::Vacant(slot) = self.sessions.entry(session_id.clone()) {
                slot.insert(Session::new(session_id.clone(), handle));
                return session_id;
            }
        }
    }

    /// Record activity. Missing sessions are ignored: the caller may be racing
    /// with reclamation.
    pub fn touch(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.last_activity_at = Instant::now();
        }
    }

    /// Move an idle session to `Streaming`.
    pub fn mark_streaming(&self, session_id: &str) -> StreamStart {
        match self.sessions.get_mut(session_id) {
            Some(mut session) if session.state == SessionState::Idle => {
                session.state = SessionState::Streaming;
                session.last_activity_at = Instant::now();
                StreamStart::Started
            }
            Some(_) => StreamStart::AlreadyStreaming,
            None => StreamStart::Gone,
        }
    }

    pub fn mark_idle(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.state = SessionState::Idle;
        }
    }

    pub fn bind_conversation(&self, session_id: &str, conversation_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.conversation_id = Some(conversation_id.to_string());
        }
    }

    pub fn conversation_of(&self, session_id: &str) -> Option<String> {
        self.sessions
            .get(session_id)
            .and_then(|session| session.conversation_id.clone())
    }

    pub fn state_of(&self, session_id: &str) -> Option<SessionState> {
        self.sessions.get(session_id).map(|session| session.state)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Remove a session and hand its socket back to the caller for closing.
    pub fn remove(&self, session_id: &str) -> Option<SocketHandle> {
        self.sessions
            .remove(session_id)
            .map(|(_, session)| session.handle)
    }

    /// Ids of idle sessions whose last activity is older than `threshold`.
    /// Streaming sessions are never returned, however stale.
    pub fn all_idle_older_than(&self, threshold: Duration, now: Instant) -> HashSet<String> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().is_reclaimable(threshold, now))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Remove the session only if it is still idle and stale under the map
    /// lock. A turn that started after `all_idle_older_than` ran keeps it alive.
    pub fn reclaim(&self, session_id: &str, threshold: Duration, now: Instant) -> Option<SocketHandle> {
        self.sessions
            .remove_if(session_id, |_, session| session.is_reclaimable(threshold, now))
            .map(|(_, session)| session.handle)
    }

    /// Remove every session. Used at shutdown.
    pub fn drain(&self) -> Vec<(String, SocketHandle)> {
        let ids: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        ids.into_iter()
            .filter_map(|id| self.remove(&id).map(|handle| (id, handle)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
