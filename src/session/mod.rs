//! Client session persistence
//!
//! Admission talks to the session store through [`SessionStore`]: an
//! existence check for the session-present resolution, a persistence
//! call that survives the CONNECT, and invalidation of the
//! shared-subscription cache on reconnect. Brokers with durable storage
//! implement the trait over their backend; [`MemorySessionStore`] is
//! the in-process implementation.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use crate::protocol::Connect;

#[cfg(test)]
mod tests;

/// Session persistence error types
#[derive(Debug)]
pub enum SessionError {
    /// The backing store failed to persist the session
    Persistence(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Persistence(msg) => write!(f, "Persistence error: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}

/// Contract between admission and the persisted client-session store
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Whether a non-expired session exists for the client identifier
    async fn exists(&self, client_id: &str) -> bool;

    /// Persist the session of a connecting client. `session_exists` is
    /// the admission-time existence decision (always false for clean
    /// starts); the returned flag is the CONNACK's session-present.
    async fn start_persistence(
        &self,
        connect: &Connect,
        session_exists: bool,
        session_expiry_interval: u32,
    ) -> Result<bool, SessionError>;

    /// Drop cached shared-subscription state for the client. Called on
    /// every admission so a session that expired while disconnected
    /// cannot leave stale cache entries behind.
    fn invalidate_shared_cache(&self, client_id: &str);
}

/// A stored client session
#[derive(Debug, Clone)]
struct StoredSession {
    session_expiry_interval: u32,
    connected: bool,
    disconnected_at: Option<Instant>,
}

impl StoredSession {
    fn is_expired(&self) -> bool {
        if self.connected {
            return false;
        }
        if self.session_expiry_interval == 0 {
            return true;
        }
        if self.session_expiry_interval == u32::MAX {
            return false;
        }
        match self.disconnected_at {
            Some(at) => at.elapsed().as_secs() >= self.session_expiry_interval as u64,
            None => false,
        }
    }
}

/// In-memory session store
pub struct MemorySessionStore {
    sessions: DashMap<Arc<str>, StoredSession>,
    shared_cache: DashMap<Arc<str>, Vec<String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            shared_cache: DashMap::new(),
        }
    }

    /// Mark a session disconnected, starting its expiry clock. Sessions
    /// with expiry 0 are removed immediately.
    pub fn mark_disconnected(&self, client_id: &str) {
        let remove = match self.sessions.get_mut(client_id) {
            Some(mut session) => {
                session.connected = false;
                session.disconnected_at = Some(Instant::now());
                session.session_expiry_interval == 0
            }
            None => false,
        };
        // Remove after releasing the map guard
        if remove {
            self.sessions.remove(client_id);
        }
    }

    /// Cache shared-subscription state for a client (used by the
    /// delivery path; admission only invalidates)
    pub fn cache_shared_subscriptions(&self, client_id: Arc<str>, groups: Vec<String>) {
        self.shared_cache.insert(client_id, groups);
    }

    pub fn cached_shared_subscriptions(&self, client_id: &str) -> Option<Vec<String>> {
        self.shared_cache.get(client_id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn exists(&self, client_id: &str) -> bool {
        match self.sessions.get(client_id) {
            Some(session) => !session.is_expired(),
            None => false,
        }
    }

    async fn start_persistence(
        &self,
        connect: &Connect,
        session_exists: bool,
        session_expiry_interval: u32,
    ) -> Result<bool, SessionError> {
        let client_id: Arc<str> = Arc::from(connect.client_id.as_str());
        trace!(
            client_id = %client_id,
            session_exists,
            session_expiry_interval,
            "persisting session"
        );

        let resumable = session_exists
            && self
                .sessions
                .get(&client_id)
                .map(|s| !s.is_expired())
                .unwrap_or(false);

        if resumable {
            if let Some(mut session) = self.sessions.get_mut(&client_id) {
                session.connected = true;
                session.disconnected_at = None;
                session.session_expiry_interval = session_expiry_interval;
                return Ok(true);
            }
        }

        self.sessions.insert(
            client_id,
            StoredSession {
                session_expiry_interval,
                connected: true,
                disconnected_at: None,
            },
        );
        Ok(false)
    }

    fn invalidate_shared_cache(&self, client_id: &str) {
        self.shared_cache.remove(client_id);
    }
}
