//! Per-connection session state.
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// The room every session starts in and falls back to on `leave`.
pub const LOBBY: &str = "lobby";

/// Opaque session identity. Allocated in increasing order by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a line could not be handed to a session's writer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("session {0} is closed")]
    Closed(SessionId),
    #[error("session {0} did not accept the line within {1:?}")]
    TimedOut(SessionId, Duration),
}

/// Mutable identity and routing fields.
///
/// Written only by the session's own handler task; read by routers running
/// on other connections' tasks.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Empty until the `user` handshake.
    pub username: String,
    pub room: String,
    /// Usernames whose broadcasts this session no longer receives.
    pub ignoring: HashSet<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            username: String::new(),
            room: LOBBY.to_owned(),
            ignoring: HashSet::new(),
        }
    }
}

impl SessionState {
    pub fn is_identified(&self) -> bool {
        !self.username.is_empty()
    }

    pub fn is_ignoring(&self, username: &str) -> bool {
        self.ignoring.contains(username)
    }
}

/// A connected client.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub addr: SocketAddr,
    state: RwLock<SessionState>,
    /// Queue drained by the connection's writer task.
    outbound: mpsc::Sender<String>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Session {
    pub fn new(id: SessionId, addr: SocketAddr, outbound: mpsc::Sender<String>) -> Self {
        Self {
            id,
            addr,
            state: RwLock::new(SessionState::default()),
            outbound,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Copy of the current identity and routing fields.
    pub async fn snapshot(&self) -> SessionState {
        self.state.read().await.clone()
    }

    pub async fn username(&self) -> String {
        self.state.read().await.username.clone()
    }

    pub async fn room(&self) -> String {
        self.state.read().await.room.clone()
    }

    /// Claim a username. Returns `false` if one is already set or the
    /// requested name is empty; the username is set exactly once.
    pub async fn identify(&self, username: &str) -> bool {
        let mut st = self.state.write().await;
        if st.is_identified() || username.is_empty() {
            return false;
        }
        st.username = username.to_owned();
        true
    }

    /// Move to `room`, returning the room left behind.
    pub async fn enter(&self, room: &str) -> String {
        let mut st = self.state.write().await;
        std::mem::replace(&mut st.room, room.to_owned())
    }

    /// Return to the lobby, returning the room left behind, or `None` if
    /// already there.
    pub async fn leave(&self) -> Option<String> {
        let mut st = self.state.write().await;
        if st.room == LOBBY {
            return None;
        }
        Some(std::mem::replace(&mut st.room, LOBBY.to_owned()))
    }

    pub async fn ignore(&self, username: &str) {
        self.state.write().await.ignoring.insert(username.to_owned());
    }

    /// Queue one line for the writer, waiting at most `timeout` for room in
    /// the queue.
    pub async fn deliver(&self, line: String, timeout: Duration) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed(self.id));
        }
        self.outbound
            .send_timeout(line, timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => DeliveryError::TimedOut(self.id, timeout),
                SendTimeoutError::Closed(_) => DeliveryError::Closed(self.id),
            })
    }

    /// Mark the session closed and stop its reader and writer.
    ///
    /// Returns `true` only for the call that actually closed it, so the
    /// teardown path runs once no matter who notices the failure first.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        self.shutdown.cancel();
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
