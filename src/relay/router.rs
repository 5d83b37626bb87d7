//! Broadcast routing: who receives an outgoing action, and the fan-out.
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, warn};

use super::actions::{Action, ActionLog};
use super::message::{ActionKind, Command};
use super::registry::Registry;
use super::session::{Session, SessionState};

/// Who a send is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Only the originating session. Not logged.
    Private,
    /// Every identified session that passes the room and ignore filters.
    Broadcast,
}

/// Routes actions from one session to the rest of the registry.
#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<Registry>,
    actions: Arc<ActionLog>,
    write_timeout: Duration,
}

impl Router {
    pub fn new(registry: Arc<Registry>, actions: Arc<ActionLog>, write_timeout: Duration) -> Self {
        Self {
            registry,
            actions,
            write_timeout,
        }
    }

    /// Send `kind` with `body` on behalf of `origin`.
    ///
    /// Broadcasts from a session without a username are dropped. Returns the
    /// number of sessions the line was handed to.
    pub async fn send(
        &self,
        kind: ActionKind,
        body: &str,
        origin: &Session,
        delivery: Delivery,
    ) -> usize {
        match delivery {
            Delivery::Private => {
                let line = Command::new(kind.as_str(), body).to_server_line();
                match origin.deliver(line, self.write_timeout).await {
                    Ok(()) => 1,
                    Err(e) => {
                        debug!(session = %origin.id, "private {kind} dropped: {e}");
                        0
                    }
                }
            }
            Delivery::Broadcast => self.broadcast(kind, body, origin).await,
        }
    }

    async fn broadcast(&self, kind: ActionKind, body: &str, origin: &Session) -> usize {
        let from = origin.snapshot().await;
        if !from.is_identified() {
            debug!(session = %origin.id, "broadcast of {kind} from unidentified session dropped");
            return 0;
        }

        self.actions
            .record(Action::now(
                kind.as_str(),
                body,
                from.username.as_str(),
                origin.addr.to_string(),
            ))
            .await;

        let line = Command {
            name: kind.as_str().to_owned(),
            username: Some(from.username.clone()),
            body: body.to_owned(),
        }
        .to_server_line();

        let mut recipients = Vec::new();
        for session in self.registry.iterate().await {
            let to = session.snapshot().await;
            if accepts(kind, origin, &from, &session, &to) {
                recipients.push(session);
            }
        }

        let deliveries = recipients.iter().map(|session| {
            let line = line.clone();
            async move {
                match session.deliver(line, self.write_timeout).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(session = %session.id, addr = %session.addr, "delivery of {kind} failed: {e}");
                        false
                    }
                }
            }
        });

        join_all(deliveries).await.into_iter().filter(|ok| *ok).count()
    }
}

/// Whether `to` should see a broadcast of `kind` from `from`.
fn accepts(
    kind: ActionKind,
    origin: &Session,
    from: &SessionState,
    recipient: &Session,
    to: &SessionState,
) -> bool {
    if !to.is_identified() {
        return false;
    }
    if kind == ActionKind::Message && (recipient.id == origin.id || to.room != from.room) {
        return false;
    }
    !to.is_ignoring(&from.username)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::actions::ActionFilter;
    use pretty_assertions::assert_eq;
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    const TIMEOUT: Duration = Duration::from_millis(50);

    struct Harness {
        registry: Arc<Registry>,
        actions: Arc<ActionLog>,
        router: Router,
    }

    impl Harness {
        fn new() -> Self {
            let registry = Arc::new(Registry::new());
            let actions = Arc::new(ActionLog::in_memory());
            let router = Router::new(Arc::clone(&registry), Arc::clone(&actions), TIMEOUT);
            Self {
                registry,
                actions,
                router,
            }
        }

        async fn join(&self, username: &str) -> (Arc<Session>, mpsc::Receiver<String>) {
            let (tx, rx) = mpsc::channel(16);
            let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
            let session = Arc::new(Session::new(self.registry.next_id(), addr, tx));
            if !username.is_empty() {
                session.identify(username).await;
            }
            self.registry.register(Arc::clone(&session)).await;
            (session, rx)
        }
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn private_send_reaches_origin_only() {
        let h = Harness::new();
        let (alice, mut alice_rx) = h.join("").await;
        let (_bob, mut bob_rx) = h.join("bob").await;

        let n = h
            .router
            .send(ActionKind::Ready, "", &alice, Delivery::Private)
            .await;
        assert_eq!(n, 1);
        assert_eq!(drain(&mut alice_rx), vec!["/ready"]);
        assert!(drain(&mut bob_rx).is_empty());
        assert!(h.actions.is_empty().await);
    }

    #[tokio::test]
    async fn message_reaches_room_mates_but_not_sender() {
        let h = Harness::new();
        let (alice, mut alice_rx) = h.join("alice").await;
        let (_bob, mut bob_rx) = h.join("bob").await;
        let (carol, mut carol_rx) = h.join("carol").await;
        carol.enter("attic").await;

        h.router
            .send(ActionKind::Message, "hi", &alice, Delivery::Broadcast)
            .await;

        assert_eq!(drain(&mut bob_rx), vec!["/message [alice] hi"]);
        assert!(drain(&mut alice_rx).is_empty());
        assert!(drain(&mut carol_rx).is_empty());
    }

    #[tokio::test]
    async fn announcements_ignore_rooms() {
        let h = Harness::new();
        let (alice, mut alice_rx) = h.join("alice").await;
        let (bob, mut bob_rx) = h.join("bob").await;
        bob.enter("attic").await;

        h.router
            .send(ActionKind::Enter, "kitchen", &alice, Delivery::Broadcast)
            .await;

        assert_eq!(drain(&mut alice_rx), vec!["/enter [alice] kitchen"]);
        assert_eq!(drain(&mut bob_rx), vec!["/enter [alice] kitchen"]);
    }

    #[tokio::test]
    async fn ignoring_recipient_is_skipped() {
        let h = Harness::new();
        let (alice, mut alice_rx) = h.join("alice").await;
        let (bob, _bob_rx) = h.join("bob").await;
        alice.ignore("bob").await;

        h.router
            .send(ActionKind::Message, "yo", &bob, Delivery::Broadcast)
            .await;
        h.router
            .send(ActionKind::Enter, "attic", &bob, Delivery::Broadcast)
            .await;

        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn unidentified_sessions_neither_send_nor_receive() {
        let h = Harness::new();
        let (anon, mut anon_rx) = h.join("").await;
        let (alice, _alice_rx) = h.join("alice").await;

        let n = h
            .router
            .send(ActionKind::Message, "psst", &anon, Delivery::Broadcast)
            .await;
        assert_eq!(n, 0);
        assert!(h.actions.is_empty().await);

        h.router
            .send(ActionKind::Connect, "", &alice, Delivery::Broadcast)
            .await;
        assert!(drain(&mut anon_rx).is_empty());
    }

    #[tokio::test]
    async fn broadcast_is_logged_once() {
        let h = Harness::new();
        let (alice, _alice_rx) = h.join("alice").await;
        let (_bob, _bob_rx) = h.join("bob").await;

        h.router
            .send(ActionKind::Message, "hi", &alice, Delivery::Broadcast)
            .await;
        h.router
            .send(ActionKind::Ignoring, "bob", &alice, Delivery::Private)
            .await;

        let logged = h.actions.query(&ActionFilter::new()).await;
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].command, "message");
        assert_eq!(logged[0].username, "alice");
        assert_eq!(logged[0].content, "hi");
    }

    #[tokio::test]
    async fn stalled_recipient_does_not_block_others() {
        let h = Harness::new();
        let (alice, _alice_rx) = h.join("alice").await;

        // A recipient whose queue is already full and never drained.
        let (tx, _stalled_rx) = mpsc::channel(1);
        let addr: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let stalled = Arc::new(Session::new(h.registry.next_id(), addr, tx));
        stalled.identify("stalled").await;
        stalled.deliver("backlog".into(), TIMEOUT).await.unwrap();
        h.registry.register(Arc::clone(&stalled)).await;

        let (_bob, mut bob_rx) = h.join("bob").await;

        let n = h
            .router
            .send(ActionKind::Message, "hi", &alice, Delivery::Broadcast)
            .await;
        assert_eq!(n, 1);
        assert_eq!(drain(&mut bob_rx), vec!["/message [alice] hi"]);
    }

    #[tokio::test]
    async fn body_is_escaped_on_the_wire() {
        let h = Harness::new();
        let (alice, _alice_rx) = h.join("alice").await;
        let (_bob, mut bob_rx) = h.join("bob").await;

        h.router
            .send(ActionKind::Message, "[a]: 5%", &alice, Delivery::Broadcast)
            .await;

        let lines = drain(&mut bob_rx);
        assert_eq!(lines, vec!["/message [alice] %5Ba%5D%3A 5%25"]);
        assert_eq!(Command::parse_server(&lines[0]).body, "[a]: 5%");
    }
}
