//! The set of live sessions, shared by every connection.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use super::session::{Session, SessionId};

/// Live sessions keyed by id. Ids grow monotonically, so iteration order
/// is connection order.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: RwLock<BTreeMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a session about to be registered.
    pub fn next_id(&self) -> SessionId {
        SessionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Add a session. Returns `false` if one with the same id is present.
    pub async fn register(&self, session: Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return false;
        }
        sessions.insert(session.id, session);
        true
    }

    pub async fn deregister(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(&id)
    }

    /// Snapshot of the open sessions.
    ///
    /// The lock is held only while cloning the handles, so a concurrent
    /// deregister never disturbs a broadcast already walking the result.
    pub async fn iterate(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| !s.is_closed())
            .cloned()
            .collect()
    }

    pub async fn is_live(&self, id: SessionId) -> bool {
        self.sessions
            .read()
            .await
            .get(&id)
            .is_some_and(|s| !s.is_closed())
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
