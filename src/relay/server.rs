//! Relay server core: connection setup, the per-connection pipeline and
//! command dispatch.
//!
//! Each connection runs three tasks:
//!
//! - a **reader** that frames lines off the socket and hands them over a
//!   single-slot channel,
//! - a **handler** that decodes and executes them strictly in order,
//! - a **writer** that drains the session's outbound queue onto the socket.
//!
//! Any transport failure closes the session, which deregisters it and
//! announces `disconnect` exactly once.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use super::actions::{Action, ActionFilter, ActionLog};
use super::codec::LineCodec;
use super::config::RelayConfig;
use super::endpoint;
use super::message::{ActionKind, Command, Request};
use super::registry::Registry;
use super::router::{Delivery, Router};
use super::session::{Session, LOBBY};

/// Shared relay state. Cheap to clone; every connection holds one.
#[derive(Debug, Clone)]
pub struct Relay {
    registry: Arc<Registry>,
    actions: Arc<ActionLog>,
    router: Router,
    config: Arc<RelayConfig>,
}

impl Relay {
    /// Build a relay, opening the action log file if one is configured.
    pub async fn new(config: RelayConfig) -> Self {
        let actions = ActionLog::open(config.log_file.as_deref()).await;
        Self::with_action_log(config, actions)
    }

    pub fn with_action_log(config: RelayConfig, actions: ActionLog) -> Self {
        let registry = Arc::new(Registry::new());
        let actions = Arc::new(actions);
        let router = Router::new(
            Arc::clone(&registry),
            Arc::clone(&actions),
            config.write_timeout(),
        );
        Self {
            registry,
            actions,
            router,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Take ownership of a connected stream: register a session for it,
    /// start its reader, handler and writer, and prompt it with `ready`.
    pub async fn register_connection<S>(&self, stream: S, addr: SocketAddr) -> Arc<Session>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let codec = LineCodec::new(self.config.max_line_length);

        let (out_tx, out_rx) = mpsc::channel::<String>(self.config.outbound_queue.max(1));
        let session = Arc::new(Session::new(self.registry.next_id(), addr, out_tx));
        self.registry.register(Arc::clone(&session)).await;
        info!(%addr, session = %session.id, "session registered");

        tokio::spawn(write_loop(
            FramedWrite::new(write_half, codec.clone()),
            out_rx,
            Arc::clone(&session),
            self.config.write_timeout(),
        ));

        // Single slot: a slow handler stalls only this connection's reader.
        let (line_tx, line_rx) = mpsc::channel::<String>(1);
        tokio::spawn(
            self.clone()
                .read_loop(FramedRead::new(read_half, codec), line_tx, Arc::clone(&session)),
        );
        tokio::spawn(self.clone().handle_loop(line_rx, Arc::clone(&session)));

        self.router
            .send(ActionKind::Ready, "", &session, Delivery::Private)
            .await;

        session
    }

    /// Decode and execute one inbound line for `session`.
    pub async fn submit_line(&self, session: &Session, raw: &str) {
        let line = raw.trim();
        if line.is_empty() {
            return;
        }

        match Request::from(Command::parse_client(line)) {
            Request::User(username) => self.on_user(session, &username).await,
            Request::Message(body) => {
                self.router
                    .send(ActionKind::Message, &body, session, Delivery::Broadcast)
                    .await;
            }
            Request::Enter(room) => self.on_enter(session, &room).await,
            Request::Leave => self.on_leave(session).await,
            Request::Ignore(target) => self.on_ignore(session, &target).await,
            Request::Disconnect => self.disconnect(session).await,
            Request::Unrecognized(name) => {
                debug!(session = %session.id, command = %name, "unrecognized command");
                self.router
                    .send(ActionKind::Unrecognized, "", session, Delivery::Private)
                    .await;
            }
            Request::Empty => {
                debug!(session = %session.id, "dropping line without a command name");
            }
        }
    }

    async fn on_user(&self, session: &Session, username: &str) {
        if !session.identify(username).await {
            debug!(session = %session.id, "ignoring repeated or empty handshake");
            return;
        }
        info!(session = %session.id, username, "session identified");
        self.router
            .send(ActionKind::Connect, "", session, Delivery::Broadcast)
            .await;
    }

    async fn on_enter(&self, session: &Session, room: &str) {
        if room.is_empty() {
            return;
        }
        session.enter(room).await;
        self.router
            .send(ActionKind::Enter, room, session, Delivery::Broadcast)
            .await;
    }

    async fn on_leave(&self, session: &Session) {
        let room = session.room().await;
        if room == LOBBY {
            return;
        }
        // Announce while the sender is still in the room it is leaving.
        self.router
            .send(ActionKind::Leave, &room, session, Delivery::Broadcast)
            .await;
        session.leave().await;
    }

    async fn on_ignore(&self, session: &Session, target: &str) {
        if target.is_empty() {
            return;
        }
        session.ignore(target).await;
        self.router
            .send(ActionKind::Ignoring, target, session, Delivery::Private)
            .await;
    }

    /// Close `session`, deregister it and announce `disconnect`.
    ///
    /// Safe to call from any task, any number of times. The session may
    /// already be closed (the writer closes it on a failed write); teardown
    /// runs for whichever call removes it from the registry.
    pub async fn disconnect(&self, session: &Session) {
        session.close();
        if self.registry.deregister(session.id).await.is_none() {
            return;
        }
        self.router
            .send(ActionKind::Disconnect, "", session, Delivery::Broadcast)
            .await;
        info!(addr = %session.addr, session = %session.id, "session closed");
    }

    /// Actions recorded so far that match `filter`, oldest first.
    pub async fn query_actions(&self, filter: &ActionFilter) -> Vec<Action> {
        self.actions.query(filter).await
    }

    /// Reader: frame lines and hand them to the handler until the
    /// transport fails or the session is closed.
    async fn read_loop<R>(
        self,
        mut reader: FramedRead<ReadHalf<R>, LineCodec>,
        line_tx: mpsc::Sender<String>,
        session: Arc<Session>,
    ) where
        R: AsyncRead + AsyncWrite + Send + 'static,
    {
        let shutdown = session.shutdown_token();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = reader.next() => {
                    match frame {
                        Some(Ok(line)) => {
                            tokio::select! {
                                _ = shutdown.cancelled() => break,
                                sent = line_tx.send(line) => {
                                    if sent.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => {
                            warn!(addr = %session.addr, session = %session.id, "read error: {e}");
                            break;
                        }
                        None => break, // Connection closed.
                    }
                }
            }
        }

        drop(line_tx);
        self.disconnect(&session).await;
    }

    /// Handler: execute lines one at a time, in arrival order.
    async fn handle_loop(self, mut line_rx: mpsc::Receiver<String>, session: Arc<Session>) {
        while let Some(line) = line_rx.recv().await {
            if session.is_closed() {
                break;
            }
            self.submit_line(&session, &line).await;
        }
        debug!(session = %session.id, "handler finished");
    }

    /// Accept connections from `listener` forever.
    pub async fn serve(
        self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (socket, addr) = listener.accept().await?;
            info!(%addr, "new connection");
            self.register_connection(socket, addr).await;
        }
    }
}

/// Writer: drain the outbound queue onto the socket. A failed or
/// timed-out write closes the session, which stops the reader; the reader
/// then deregisters the session and announces `disconnect`.
async fn write_loop<W>(
    mut writer: FramedWrite<WriteHalf<W>, LineCodec>,
    mut out_rx: mpsc::Receiver<String>,
    session: Arc<Session>,
    timeout: Duration,
) where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    let shutdown = session.shutdown_token();
    loop {
        tokio::select! {
            biased;
            line = out_rx.recv() => {
                let Some(line) = line else { break };
                if let Err(e) = write_line(&mut writer, line, timeout).await {
                    warn!(addr = %session.addr, session = %session.id, "write error: {e}");
                    session.close();
                    return;
                }
            }
            _ = shutdown.cancelled() => {
                // Flush whatever was queued before the close.
                while let Ok(line) = out_rx.try_recv() {
                    if write_line(&mut writer, line, timeout).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    match tokio::time::timeout(timeout, SinkExt::<String>::close(&mut writer)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(session = %session.id, "closing writer failed: {e}"),
        Err(_) => debug!(session = %session.id, "writer did not close within {timeout:?}"),
    }
}

async fn write_line<W>(
    writer: &mut FramedWrite<WriteHalf<W>, LineCodec>,
    line: String,
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    tokio::time::timeout(timeout, writer.send(line)).await??;
    Ok(())
}

/// Run the relay: bind the chat listener (and the query endpoint when
/// configured) and accept connections until an error occurs.
pub async fn run(config: RelayConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let relay = Relay::new(config).await;

    let addr = format!("0.0.0.0:{}", relay.config().port);
    let listener = TcpListener::bind(&addr).await?;
    info!("chat relay listening on {addr}");

    if let Some(port) = relay.config().query_port {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr).await?;
        info!("action query endpoint listening on {addr}");
        let app = endpoint::router(relay.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("query endpoint stopped: {e}");
            }
        });
    }

    relay.serve(listener).await
}
