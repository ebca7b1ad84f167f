//! Session registry.
//!
//! A session is a logical client handle on one keyspace/shard. Ids are
//! random and nonzero; the registry is the only place that knows them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use rand::Rng;
use tablet_common::error::{TabletError, TabletResult};
use tablet_common::types::SessionId;
use tracing::debug;

/// A registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Session id.
    pub id: SessionId,
    /// Keyspace the session was opened on.
    pub keyspace: String,
    /// Shard the session was opened on.
    pub shard: String,
    /// When the session was opened.
    pub opened_at: Instant,
}

/// Tracks live sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Session>>,
    opened: AtomicU64,
    closed: AtomicU64,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new session and returns its id.
    pub fn open(&self, keyspace: &str, shard: &str) -> SessionId {
        let mut rng = rand::thread_rng();
        let mut sessions = self.sessions.write();
        let id = loop {
            let candidate = SessionId::new(rng.gen_range(1..=i64::MAX as u64));
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        sessions.insert(
            id,
            Session {
                id,
                keyspace: keyspace.to_string(),
                shard: shard.to_string(),
                opened_at: Instant::now(),
            },
        );
        self.opened.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = %id, keyspace, shard, "session opened");
        id
    }

    /// Looks up a session.
    ///
    /// # Errors
    ///
    /// `InvalidSession` if the id is unknown.
    pub fn get(&self, id: SessionId) -> TabletResult<Session> {
        self.sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| invalid(id))
    }

    /// Checks that a session exists.
    ///
    /// # Errors
    ///
    /// `InvalidSession` if the id is unknown.
    pub fn validate(&self, id: SessionId) -> TabletResult<()> {
        if self.sessions.read().contains_key(&id) {
            Ok(())
        } else {
            Err(invalid(id))
        }
    }

    /// Removes a session.
    ///
    /// # Errors
    ///
    /// `InvalidSession` if the id is unknown.
    pub fn close(&self, id: SessionId) -> TabletResult<Session> {
        let session = self.sessions.write().remove(&id).ok_or_else(|| invalid(id))?;
        self.closed.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = %id, "session closed");
        Ok(session)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns true if no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Total sessions opened.
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    /// Total sessions closed.
    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }
}

fn invalid(id: SessionId) -> TabletError {
    TabletError::invalid_session(format!("session {id} is not valid"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablet_common::error::ErrorKind;

    #[test]
    fn test_open_and_get() {
        let registry = SessionRegistry::new();
        let id = registry.open("test_keyspace", "0");
        assert!(id.is_valid());

        let session = registry.get(id).unwrap();
        assert_eq!(session.keyspace, "test_keyspace");
        assert_eq!(session.shard, "0");
        registry.validate(id).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_ids_are_distinct() {
        let registry = SessionRegistry::new();
        let a = registry.open("ks", "0");
        let b = registry.open("ks", "0");
        assert_ne!(a, b);
        assert_eq!(registry.opened(), 2);
    }

    #[test]
    fn test_close() {
        let registry = SessionRegistry::new();
        let id = registry.open("ks", "-80");
        registry.close(id).unwrap();

        assert_eq!(registry.get(id).unwrap_err().kind(), ErrorKind::InvalidSession);
        assert_eq!(registry.close(id).unwrap_err().kind(), ErrorKind::InvalidSession);
        assert!(registry.is_empty());
        assert_eq!(registry.closed(), 1);
    }

    #[test]
    fn test_unknown_session() {
        let registry = SessionRegistry::new();
        let err = registry.validate(SessionId::new(5678)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSession);
        assert_eq!(err.to_string(), "error: session 5678 is not valid");
    }
}
