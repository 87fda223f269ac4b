//! Connection task: the single owner of the link and all protocol state.
//!
//! [`Connection::run`] is spawned once per client. It holds the transport,
//! the command registry, the outbound queue and the reconnect timer, and
//! multiplexes over them with `tokio::select!`. Nothing else writes to the
//! transport, so commands are framed and sent in the order this task issues
//! them.
//!
//! Lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Authenticated
//!                     ^  |          |             |
//!                     |  +----------+-------------+--> Reconnecting --+
//!                     +-----------------------------------------------+
//! any state -> Closed
//! ```
//!
//! Only `auth` is written while the link is unauthenticated. Everything else
//! waits in the registry (marked unsent) and goes out in id order once the
//! server accepts the token. A lost link marks every command unsent again, so
//! unacknowledged work is replayed after the next successful `auth`.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::Sleep;
use tracing::{debug, error, info, warn};

use crate::auth::TokenIssuer;
use crate::backoff::Backoff;
use crate::client::ClientConfig;
use crate::codec::Frame;
use crate::error::{Result, SnapperError};
use crate::event::{EventSink, SnapperEvent};
use crate::protocol::{self, Incoming, METHOD_AUTH, METHOD_PUBLISH};
use crate::queue::OutboundQueue;
use crate::registry::{Reply, RpcRegistry};
use crate::transport::{Connector, Transport};

type ConnectFuture = Pin<Box<dyn Future<Output = Result<Box<dyn Transport>>> + Send>>;

// ── State ───────────────────────────────────────────────────────────

/// Connection lifecycle as seen from the client handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started yet.
    Disconnected,
    /// Opening a transport.
    Connecting,
    /// Transport is up; waiting for the `auth` response.
    Connected,
    /// The server accepted the token; all traffic flows.
    Authenticated,
    /// Waiting `delay` before reconnect attempt `attempt`.
    Reconnecting {
        /// 1-based attempt number since the last successful connect.
        attempt: u32,
        /// Backoff delay before the attempt.
        delay: Duration,
    },
    /// Terminal. Every operation fails with [`SnapperError::Closed`].
    Closed,
}

/// State shared between the client handle and the connection task.
#[derive(Debug)]
pub(crate) struct SharedState {
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) session_id: Mutex<Option<String>>,
    pub(crate) closed: AtomicBool,
}

impl SharedState {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            session_id: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }
}

/// Work submitted by the client handle.
#[derive(Debug)]
pub(crate) enum Command {
    /// Queue one fire-and-forget message.
    Publish { room: String, message: Value },
    /// Issue an RPC.
    Request {
        method: String,
        params: Vec<Value>,
        reply: Reply,
    },
}

// ── Connection task ─────────────────────────────────────────────────

pub(crate) struct Connection {
    connector: Arc<dyn Connector>,
    tokens: TokenIssuer,
    registry: RpcRegistry,
    queue: OutboundQueue,
    backoff: Backoff,
    invalidation_codes: Vec<i64>,
    events: EventSink,
    shared: Arc<SharedState>,
    state: ConnectionState,
    transport: Option<Box<dyn Transport>>,
    connecting: Option<ConnectFuture>,
    retry: Option<Pin<Box<Sleep>>>,
    auth_id: Option<u64>,
}

impl Connection {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        tokens: TokenIssuer,
        config: &ClientConfig,
        events: EventSink,
        shared: Arc<SharedState>,
    ) -> Self {
        Self {
            connector,
            tokens,
            registry: RpcRegistry::new(config.rpc_timeout, events.clone()),
            queue: OutboundQueue::new(config.batch_size, config.rpc_high_water),
            backoff: Backoff::new(config.backoff.clone()),
            invalidation_codes: config.session_invalidation_codes.clone(),
            events,
            shared,
            state: ConnectionState::Disconnected,
            transport: None,
            connecting: None,
            retry: None,
            auth_id: None,
        }
    }

    /// Drive the connection until it closes.
    ///
    /// Exits when:
    /// - the shutdown signal fires or its sender is dropped
    /// - the command channel closes (client handle dropped)
    /// - reconnection is exhausted, auth is rejected or signing fails
    pub(crate) async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        debug!("connection task started");
        self.start_connect();

        while self.state != ConnectionState::Closed {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!("shutdown signal received");
                    self.close().await;
                }

                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        debug!("command channel closed, shutting down connection task");
                        self.close().await;
                    }
                },

                result = wait_connect(&mut self.connecting), if self.connecting.is_some() => {
                    self.connecting = None;
                    self.on_connect(result).await;
                }

                () = wait_retry(&mut self.retry), if self.retry.is_some() => {
                    self.retry = None;
                    self.begin_attempt();
                }

                frame = recv_frame(&mut self.transport), if self.transport.is_some() => {
                    self.on_frame(frame).await;
                }

                Some(id) = self.registry.next_expired() => {
                    self.on_timeout(id).await;
                }
            }
        }

        debug!("connection task exited");
    }

    // ── Commands ────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Publish { room, message } => {
                self.queue.push(room, message);
                debug!(queued = self.queue.len(), "message queued");
                self.flush().await;
            }
            Command::Request {
                method,
                params,
                reply,
            } => {
                if let Some(id) = self.registry.create(&method, &params, reply) {
                    self.send_queued(id).await;
                }
            }
        }
    }

    /// Write a command if the link is authenticated; otherwise it stays
    /// unsent and goes out on replay.
    async fn send_queued(&mut self, id: u64) {
        if self.state == ConnectionState::Authenticated {
            self.send_priority(id).await;
        } else {
            debug!(id, state = ?self.state, "command held until authenticated");
        }
    }

    /// Write a command regardless of state. Returns `false` if the link was
    /// lost.
    async fn send_priority(&mut self, id: u64) -> bool {
        let (Some(frame), Some(transport)) = (self.registry.frame(id), self.transport.as_mut())
        else {
            return false;
        };
        match transport.send(frame).await {
            Ok(()) => {
                self.registry.mark_sent(id);
                true
            }
            Err(e) => {
                error!(id, "transport send error: {e}");
                self.events.emit(SnapperEvent::Error(e));
                self.link_lost().await;
                false
            }
        }
    }

    /// Turn queued messages into `publish` commands until the queue is empty
    /// or the high-water mark is reached.
    async fn flush(&mut self) {
        while self.state == ConnectionState::Authenticated {
            let Some(batch) = self.queue.next_batch(self.registry.len()) else {
                break;
            };
            let count = batch.len();
            if let Some(id) = self.registry.create(METHOD_PUBLISH, &batch, Reply::Detached) {
                debug!(id, count, "publishing batch");
                self.send_priority(id).await;
            }
        }
    }

    /// Resend every unsent command in id order.
    async fn replay(&mut self) {
        let ids = self.registry.unsent_ids();
        if !ids.is_empty() {
            info!(count = ids.len(), "replaying unacknowledged commands");
        }
        for id in ids {
            if !self.send_priority(id).await {
                break;
            }
        }
    }

    // ── Link lifecycle ──────────────────────────────────────────────

    fn start_connect(&mut self) {
        self.set_state(ConnectionState::Connecting);
        let connector = Arc::clone(&self.connector);
        self.connecting = Some(Box::pin(async move { connector.connect().await }));
    }

    fn begin_attempt(&mut self) {
        if let ConnectionState::Reconnecting { attempt, delay } = self.state {
            self.events.emit(SnapperEvent::Reconnecting {
                delay,
                attempts: attempt,
            });
        }
        self.start_connect();
    }

    async fn on_connect(&mut self, result: Result<Box<dyn Transport>>) {
        match result {
            Ok(transport) => {
                info!("connected to Snapper server");
                self.backoff.reset();
                self.transport = Some(transport);
                self.set_state(ConnectionState::Connected);
                self.authenticate().await;
            }
            Err(e) => {
                warn!("connect failed: {e}");
                self.events.emit(SnapperEvent::Error(e));
                self.schedule_reconnect().await;
            }
        }
    }

    /// Sign a fresh token and write `auth` ahead of everything else.
    async fn authenticate(&mut self) {
        let token = match self.tokens.producer_token() {
            Ok(token) => token,
            Err(e) => {
                error!("failed to sign auth token: {e}");
                self.events.emit(SnapperEvent::Error(e));
                self.close().await;
                return;
            }
        };
        if let Some(stale) = self.auth_id.take() {
            self.registry.discard(stale);
        }
        match self
            .registry
            .create(METHOD_AUTH, &[Value::String(token)], Reply::Internal)
        {
            Some(id) => {
                debug!(id, "sending auth");
                self.auth_id = Some(id);
                self.send_priority(id).await;
            }
            None => {
                error!("failed to encode auth request");
                self.link_lost().await;
            }
        }
    }

    async fn on_auth(&mut self, outcome: Result<Value>) {
        self.auth_id = None;
        match outcome {
            Ok(result) => {
                let session_id = match result.get("id") {
                    Some(Value::String(id)) => Some(id.clone()),
                    Some(Value::Number(id)) => Some(id.to_string()),
                    _ => None,
                };
                info!(session_id = ?session_id, "authenticated");
                *self.shared.session_id.lock().await = session_id.clone();
                self.set_state(ConnectionState::Authenticated);
                self.events.emit(SnapperEvent::Connected { session_id });
                self.replay().await;
            }
            Err(e) => {
                error!("authentication rejected: {e}");
                self.events.emit(SnapperEvent::Error(e));
                self.close().await;
            }
        }
    }

    /// Drop the current link and schedule a reconnect.
    async fn link_lost(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!("transport close failed: {e}");
            }
        }
        if let Some(stale) = self.auth_id.take() {
            self.registry.discard(stale);
        }
        self.registry.mark_all_unsent();
        *self.shared.session_id.lock().await = None;
        self.schedule_reconnect().await;
    }

    async fn schedule_reconnect(&mut self) {
        match self.backoff.next_attempt() {
            Some((attempt, delay)) => {
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "connection lost, reconnecting"
                );
                self.set_state(ConnectionState::Reconnecting { attempt, delay });
                self.retry = Some(Box::pin(tokio::time::sleep(delay)));
            }
            None => {
                let attempts = self.backoff.attempts().saturating_sub(1);
                error!(attempts, "giving up reconnecting");
                self.events
                    .emit(SnapperEvent::Error(SnapperError::ReconnectExhausted { attempts }));
                self.close().await;
            }
        }
    }

    /// Enter the terminal state: fail everything, stop timers, drop the link.
    async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        info!("closing Snapper connection");
        self.shared.closed.store(true, Ordering::Release);
        self.set_state(ConnectionState::Closed);
        self.connecting = None;
        self.retry = None;
        self.auth_id = None;

        let dropped = self.queue.clear();
        if dropped > 0 {
            warn!(dropped, "discarding unsent messages");
            self.events
                .emit(SnapperEvent::Error(SnapperError::MessagesDropped { count: dropped }));
        }
        self.registry.fail_all(|| SnapperError::Closed);

        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!("transport close failed: {e}");
            }
        }
        *self.shared.session_id.lock().await = None;
        self.events.emit_closed().await;
    }

    fn set_state(&mut self, state: ConnectionState) {
        debug!(from = ?self.state, to = ?state, "connection state changed");
        self.state = state.clone();
        self.shared.state.send_replace(state);
    }

    // ── Inbound ─────────────────────────────────────────────────────

    async fn on_frame(&mut self, frame: Option<Result<Frame>>) {
        match frame {
            Some(Ok(Frame::Payload(payload))) => self.on_payload(&payload).await,
            Some(Ok(Frame::Error(message))) => {
                warn!("server error line: {message}");
                self.events
                    .emit(SnapperEvent::Error(SnapperError::Server(message)));
            }
            Some(Err(e)) => {
                error!("transport receive error: {e}");
                self.events.emit(SnapperEvent::Error(e));
                self.link_lost().await;
            }
            None => {
                info!("connection closed by server");
                self.events.emit(SnapperEvent::End);
                self.link_lost().await;
            }
        }
    }

    async fn on_payload(&mut self, payload: &[u8]) {
        let message = match protocol::parse_message(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("{e}");
                self.events.emit(SnapperEvent::Error(e));
                return;
            }
        };

        if let Incoming::Call { method, .. } = &message {
            warn!(method = %method, "unhandled server message");
            self.events
                .emit(SnapperEvent::Error(SnapperError::UnhandledMessage {
                    method: method.clone(),
                }));
            return;
        }

        if self.invalidates_session(&message) {
            warn!(id = ?message.command_id(), "session invalidated by server, reconnecting");
            self.link_lost().await;
            return;
        }

        if let Some((id, outcome)) = self.registry.respond(message) {
            if self.auth_id == Some(id) {
                self.on_auth(outcome).await;
            }
        }
        self.flush().await;
    }

    /// An error response with a session-invalidation code that answers a
    /// live command on an authenticated link. The command stays registered.
    /// Strays fall through to the registry, which reports them as warnings.
    fn invalidates_session(&self, message: &Incoming) -> bool {
        let Incoming::Failure { error, .. } = message else {
            return false;
        };
        let answers_live_command = message
            .command_id()
            .is_some_and(|id| self.registry.contains(id));
        self.state == ConnectionState::Authenticated
            && answers_live_command
            && self.invalidation_codes.contains(&error.code)
    }

    async fn on_timeout(&mut self, id: u64) {
        let is_auth = self.auth_id == Some(id);
        if let Some(Err(e)) = self.registry.expire(id) {
            if is_auth {
                warn!(id, "auth timed out, reconnecting");
                self.auth_id = None;
                self.events.emit(SnapperEvent::Error(e));
                self.link_lost().await;
                return;
            }
        }
        self.flush().await;
    }
}

async fn wait_connect(connecting: &mut Option<ConnectFuture>) -> Result<Box<dyn Transport>> {
    match connecting {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn wait_retry(retry: &mut Option<Pin<Box<Sleep>>>) {
    match retry {
        Some(sleep) => sleep.await,
        None => std::future::pending().await,
    }
}

async fn recv_frame(transport: &mut Option<Box<dyn Transport>>) -> Option<Result<Frame>> {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::auth::JwtSigner;
    use crate::backoff::BackoffPolicy;
    use crate::codec::FrameDecoder;
    use async_trait::async_trait;
    use bytes::{Bytes, BytesMut};
    use jsonwebtoken::Algorithm;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tokio_util::codec::Decoder;

    // ── In-memory link ──────────────────────────────────────────────

    /// Client side of an in-memory link.
    struct PipeTransport {
        to_server: mpsc::UnboundedSender<Bytes>,
        from_server: mpsc::UnboundedReceiver<Result<Frame>>,
    }

    #[async_trait]
    impl Transport for PipeTransport {
        async fn send(&mut self, frame: Bytes) -> std::result::Result<(), SnapperError> {
            self.to_server
                .send(frame)
                .map_err(|_| SnapperError::TransportSend("server gone".into()))
        }

        async fn recv(&mut self) -> Option<std::result::Result<Frame, SnapperError>> {
            self.from_server.recv().await
        }

        async fn close(&mut self) -> std::result::Result<(), SnapperError> {
            Ok(())
        }
    }

    /// Server side of an in-memory link. Dropping it closes the link.
    struct ServerEnd {
        requests: mpsc::UnboundedReceiver<Bytes>,
        replies: mpsc::UnboundedSender<Result<Frame>>,
    }

    impl ServerEnd {
        async fn next_request(&mut self) -> Value {
            let frame = self.requests.recv().await.expect("link closed");
            let mut buf = BytesMut::from(&frame[..]);
            match FrameDecoder::default().decode(&mut buf).unwrap().unwrap() {
                Frame::Payload(payload) => serde_json::from_slice(&payload).unwrap(),
                other => panic!("unexpected frame {other:?}"),
            }
        }

        fn send_json(&self, value: Value) {
            let payload = Bytes::from(serde_json::to_vec(&value).unwrap());
            let _ = self.replies.send(Ok(Frame::Payload(payload)));
        }

        fn reply(&self, id: &Value, result: Value) {
            self.send_json(json!({"jsonrpc": "2.0", "id": id, "result": result}));
        }

        fn reply_error(&self, id: &Value, code: i64) {
            self.send_json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": code, "message": "rejected"}
            }));
        }

        /// Read the `auth` request and accept it with `session`.
        async fn accept_auth(&mut self, session: &str) -> Value {
            let auth = self.next_request().await;
            assert_eq!(auth["method"], "auth");
            self.reply(&auth["id"], json!({"id": session}));
            auth
        }

        /// `true` if nothing was written since the last read.
        fn is_quiet(&mut self) -> bool {
            self.requests.try_recv().is_err()
        }
    }

    fn pipe() -> (PipeTransport, ServerEnd) {
        let (to_server, requests) = mpsc::unbounded_channel();
        let (replies, from_server) = mpsc::unbounded_channel();
        (
            PipeTransport {
                to_server,
                from_server,
            },
            ServerEnd { requests, replies },
        )
    }

    /// Hands out pre-built links in order, then refuses.
    struct PipeConnector {
        links: StdMutex<VecDeque<PipeTransport>>,
    }

    impl PipeConnector {
        fn with_links(n: usize) -> (Self, Vec<ServerEnd>) {
            let (clients, servers): (VecDeque<_>, Vec<_>) = (0..n).map(|_| pipe()).unzip();
            (
                Self {
                    links: StdMutex::new(clients),
                },
                servers,
            )
        }
    }

    #[async_trait]
    impl Connector for PipeConnector {
        async fn connect(&self) -> std::result::Result<Box<dyn Transport>, SnapperError> {
            match self.links.lock().unwrap().pop_front() {
                Some(link) => Ok(Box::new(link)),
                None => Err(SnapperError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "no more links",
                ))),
            }
        }
    }

    // ── Harness ─────────────────────────────────────────────────────

    struct Harness {
        cmd_tx: mpsc::UnboundedSender<Command>,
        shutdown_tx: Option<oneshot::Sender<()>>,
        events: mpsc::Receiver<SnapperEvent>,
        shared: Arc<SharedState>,
        task: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        fn start(connector: PipeConnector, config: ClientConfig) -> Self {
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            let (event_tx, events) = mpsc::channel(256);
            let shared = Arc::new(SharedState::new());
            let signer = Arc::new(JwtSigner::new(b"secret", Algorithm::HS256).unwrap());
            let tokens = TokenIssuer::new(signer, "producer-1".into(), Duration::from_secs(3600));
            let connection = Connection::new(
                Arc::new(connector),
                tokens,
                &config,
                EventSink::new(event_tx),
                Arc::clone(&shared),
            );
            let task = tokio::spawn(connection.run(cmd_rx, shutdown_rx));
            Self {
                cmd_tx,
                shutdown_tx: Some(shutdown_tx),
                events,
                shared,
                task,
            }
        }

        fn request(&self, method: &str, params: Vec<Value>) -> oneshot::Receiver<Result<Value>> {
            let (tx, rx) = oneshot::channel();
            self.cmd_tx
                .send(Command::Request {
                    method: method.into(),
                    params,
                    reply: Reply::Caller(tx),
                })
                .unwrap();
            rx
        }

        fn publish(&self, room: &str, message: Value) {
            self.cmd_tx
                .send(Command::Publish {
                    room: room.into(),
                    message,
                })
                .unwrap();
        }

        async fn next_event(&mut self) -> SnapperEvent {
            self.events.recv().await.expect("event channel closed")
        }

        async fn expect_connected(&mut self) -> Option<String> {
            match self.next_event().await {
                SnapperEvent::Connected { session_id } => session_id,
                other => panic!("expected Connected, got {other:?}"),
            }
        }

        fn state(&self) -> ConnectionState {
            self.shared.state.borrow().clone()
        }

        async fn shutdown(&mut self) {
            if let Some(tx) = self.shutdown_tx.take() {
                let _ = tx.send(());
            }
            (&mut self.task).await.unwrap();
        }
    }

    fn config() -> ClientConfig {
        ClientConfig::new(7701, "producer-1", vec!["secret".to_string()])
    }

    /// Let the connection task drain its inputs without reaching any timer
    /// that matters.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn auth_goes_first_and_session_id_is_kept() {
        let (connector, mut servers) = PipeConnector::with_links(1);
        let mut harness = Harness::start(connector, config());

        let auth = servers[0].next_request().await;
        assert_eq!(auth["jsonrpc"], "2.0");
        assert_eq!(auth["id"], 1);
        assert_eq!(auth["method"], "auth");
        assert!(auth["params"][0].as_str().unwrap().split('.').count() == 3);
        assert_eq!(harness.state(), ConnectionState::Connected);

        servers[0].reply(&auth["id"], json!({"id": "sess-1"}));
        assert_eq!(harness.expect_connected().await.as_deref(), Some("sess-1"));
        assert_eq!(harness.state(), ConnectionState::Authenticated);
        assert_eq!(
            harness.shared.session_id.lock().await.as_deref(),
            Some("sess-1")
        );

        harness.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn requests_wait_for_authentication() {
        let (connector, mut servers) = PipeConnector::with_links(1);
        let mut harness = Harness::start(connector, config());
        let auth = servers[0].next_request().await;

        let rx = harness.request("subscribe", vec![json!("lobby"), json!("c1")]);
        settle().await;
        assert!(servers[0].is_quiet());

        servers[0].reply(&auth["id"], json!({}));
        harness.expect_connected().await;

        let sub = servers[0].next_request().await;
        assert_eq!(sub["method"], "subscribe");
        assert_eq!(sub["params"], json!(["lobby", "c1"]));
        servers[0].reply(&sub["id"], json!({"ok": true}));
        assert_eq!(rx.await.unwrap().unwrap(), json!({"ok": true}));

        harness.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn queued_messages_are_batched_in_order() {
        let (connector, mut servers) = PipeConnector::with_links(1);
        let mut harness = Harness::start(connector, config().with_batch_size(2));
        let auth = servers[0].next_request().await;

        for i in 0..5 {
            harness.publish(&format!("room{i}"), json!(i));
        }
        settle().await;
        servers[0].reply(&auth["id"], json!({}));
        harness.expect_connected().await;

        let mut batches = Vec::new();
        for _ in 0..3 {
            let publish = servers[0].next_request().await;
            assert_eq!(publish["method"], "publish");
            batches.push(publish["params"].clone());
        }
        assert_eq!(
            batches,
            vec![
                json!([["room0", 0], ["room1", 1]]),
                json!([["room2", 2], ["room3", 3]]),
                json!([["room4", 4]]),
            ]
        );

        harness.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn high_water_mark_bounds_in_flight_publishes() {
        let (connector, mut servers) = PipeConnector::with_links(1);
        let mut harness = Harness::start(
            connector,
            config().with_batch_size(1).with_rpc_high_water(2),
        );
        servers[0].accept_auth("s").await;
        harness.expect_connected().await;

        for i in 0..5 {
            harness.publish("room", json!(i));
        }
        let first = servers[0].next_request().await;
        let second = servers[0].next_request().await;
        assert_eq!(first["params"], json!([["room", 0]]));
        assert_eq!(second["params"], json!([["room", 1]]));
        settle().await;
        assert!(servers[0].is_quiet());

        // One acknowledgement frees one slot.
        servers[0].reply(&first["id"], json!(true));
        let third = servers[0].next_request().await;
        assert_eq!(third["params"], json!([["room", 2]]));
        settle().await;
        assert!(servers[0].is_quiet());

        match harness.next_event().await {
            SnapperEvent::Jsonrpc { id, result } => {
                assert_eq!(json!(id), first["id"]);
                assert_eq!(result, json!(true));
            }
            other => panic!("expected Jsonrpc, got {other:?}"),
        }

        harness.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_replays_unacknowledged_commands_in_order() {
        let (connector, mut servers) = PipeConnector::with_links(2);
        let mut harness = Harness::start(connector, config());
        servers[0].accept_auth("first").await;
        harness.expect_connected().await;

        let rx_a = harness.request("subscribe", vec![json!("a"), json!("c1")]);
        let rx_b = harness.request("subscribe", vec![json!("b"), json!("c1")]);
        let a = servers[0].next_request().await;
        let b = servers[0].next_request().await;

        // Server goes away without answering.
        let mut second = servers.pop().unwrap();
        drop(servers);

        assert!(matches!(harness.next_event().await, SnapperEvent::End));
        match harness.next_event().await {
            SnapperEvent::Reconnecting { delay, attempts } => {
                assert_eq!(attempts, 1);
                assert_eq!(delay, Duration::from_secs(3));
            }
            other => panic!("expected Reconnecting, got {other:?}"),
        }

        let auth = second.accept_auth("second").await;
        assert!(auth["id"].as_u64().unwrap() > b["id"].as_u64().unwrap());
        assert_eq!(harness.expect_connected().await.as_deref(), Some("second"));

        let replay_a = second.next_request().await;
        let replay_b = second.next_request().await;
        assert_eq!(replay_a, a);
        assert_eq!(replay_b, b);

        second.reply(&replay_b["id"], json!("b-ok"));
        second.reply(&replay_a["id"], json!("a-ok"));
        assert_eq!(rx_a.await.unwrap().unwrap(), json!("a-ok"));
        assert_eq!(rx_b.await.unwrap().unwrap(), json!("b-ok"));

        harness.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn session_invalidation_forces_reconnect_and_replay() {
        let (connector, mut servers) = PipeConnector::with_links(2);
        let mut harness = Harness::start(connector, config());
        servers[0].accept_auth("s1").await;
        harness.expect_connected().await;

        let rx = harness.request("subscribe", vec![json!("lobby"), json!("c1")]);
        let sub = servers[0].next_request().await;
        servers[0].reply_error(&sub["id"], 400);

        assert!(matches!(
            harness.next_event().await,
            SnapperEvent::Reconnecting { attempts: 1, .. }
        ));
        servers[1].accept_auth("s2").await;
        harness.expect_connected().await;

        let replayed = servers[1].next_request().await;
        assert_eq!(replayed["id"], sub["id"]);
        servers[1].reply(&replayed["id"], json!("subscribed"));
        assert_eq!(rx.await.unwrap().unwrap(), json!("subscribed"));

        harness.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn other_error_codes_fail_only_the_command() {
        let (connector, mut servers) = PipeConnector::with_links(1);
        let mut harness = Harness::start(connector, config());
        servers[0].accept_auth("s").await;
        harness.expect_connected().await;

        let rx = harness.request("subscribe", vec![json!("x"), json!("c")]);
        let sub = servers[0].next_request().await;
        servers[0].reply_error(&sub["id"], -32602);

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, SnapperError::Rpc { code: -32602, .. }));
        assert_eq!(harness.state(), ConnectionState::Authenticated);

        harness.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_codes_are_configurable() {
        let (connector, mut servers) = PipeConnector::with_links(1);
        let mut harness = Harness::start(
            connector,
            config().with_session_invalidation_codes(Vec::new()),
        );
        servers[0].accept_auth("s").await;
        harness.expect_connected().await;

        let rx = harness.request("subscribe", vec![json!("x"), json!("c")]);
        let sub = servers[0].next_request().await;
        servers[0].reply_error(&sub["id"], 400);

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, SnapperError::Rpc { code: 400, .. }));
        assert_eq!(harness.state(), ConnectionState::Authenticated);

        harness.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_auth_closes_the_client() {
        let (connector, mut servers) = PipeConnector::with_links(1);
        let mut harness = Harness::start(connector, config());
        let rx = harness.request("subscribe", vec![json!("x"), json!("c")]);

        let auth = servers[0].next_request().await;
        servers[0].reply_error(&auth["id"], 401);

        assert!(matches!(
            harness.next_event().await,
            SnapperEvent::Error(SnapperError::Rpc { code: 401, .. })
        ));
        assert!(matches!(harness.next_event().await, SnapperEvent::Closed));
        assert!(matches!(rx.await.unwrap(), Err(SnapperError::Closed)));
        assert_eq!(harness.state(), ConnectionState::Closed);
        assert!(harness.shared.closed.load(Ordering::Acquire));
        (&mut harness.task).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn auth_timeout_is_treated_as_a_dead_link() {
        let (connector, mut servers) = PipeConnector::with_links(2);
        let mut harness = Harness::start(
            connector,
            config().with_rpc_timeout(Duration::from_secs(5)),
        );
        let first_auth = servers[0].next_request().await;

        assert!(matches!(
            harness.next_event().await,
            SnapperEvent::Error(SnapperError::Timeout { .. })
        ));
        assert!(matches!(
            harness.next_event().await,
            SnapperEvent::Reconnecting { attempts: 1, .. }
        ));

        // A late answer on the old link is ignored; the new link re-auths.
        let second_auth = servers[1].accept_auth("late").await;
        assert_ne!(second_auth["id"], first_auth["id"]);
        assert_eq!(harness.expect_connected().await.as_deref(), Some("late"));

        harness.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn rpc_timeout_fails_only_that_command() {
        let (connector, mut servers) = PipeConnector::with_links(1);
        let mut harness = Harness::start(
            connector,
            config().with_rpc_timeout(Duration::from_secs(5)),
        );
        servers[0].accept_auth("s").await;
        harness.expect_connected().await;

        let rx = harness.request("subscribe", vec![json!("x"), json!("c")]);
        let sub = servers[0].next_request().await;

        let err = rx.await.unwrap().unwrap_err();
        assert!(
            matches!(err, SnapperError::Timeout { id, ref method } if json!(id) == sub["id"] && method == "subscribe")
        );
        assert_eq!(harness.state(), ConnectionState::Authenticated);

        // A response arriving after the timeout is unmatched.
        servers[0].reply(&sub["id"], json!("too late"));
        assert!(matches!(harness.next_event().await, SnapperEvent::Warn(_)));

        harness.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_close_the_client() {
        let (connector, _servers) = PipeConnector::with_links(0);
        let backoff = BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            growth_factor: 2.0,
            max_delay: Duration::from_secs(1),
            max_attempts: 2,
        };
        let mut harness = Harness::start(connector, config().with_backoff(backoff));

        let mut reconnecting = Vec::new();
        loop {
            match harness.next_event().await {
                SnapperEvent::Error(SnapperError::Io(_)) => {}
                SnapperEvent::Reconnecting { delay, attempts } => reconnecting.push((attempts, delay)),
                SnapperEvent::Error(SnapperError::ReconnectExhausted { attempts }) => {
                    assert_eq!(attempts, 2);
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(
            reconnecting,
            vec![
                (1, Duration::from_millis(100)),
                (2, Duration::from_millis(200))
            ]
        );
        assert!(matches!(harness.next_event().await, SnapperEvent::Closed));
        assert_eq!(harness.state(), ConnectionState::Closed);
        (&mut harness.task).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn close_fails_every_pending_command() {
        let (connector, mut servers) = PipeConnector::with_links(1);
        let mut harness = Harness::start(connector, config());
        servers[0].accept_auth("s").await;
        harness.expect_connected().await;

        let receivers: Vec<_> = (0..3)
            .map(|i| harness.request("subscribe", vec![json!(format!("r{i}")), json!("c")]))
            .collect();
        for _ in 0..3 {
            servers[0].next_request().await;
        }

        harness.shutdown().await;
        for rx in receivers {
            assert!(matches!(rx.await.unwrap(), Err(SnapperError::Closed)));
        }
        assert!(matches!(harness.next_event().await, SnapperEvent::Closed));
        assert_eq!(harness.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn garbage_and_server_calls_are_reported_without_dropping_the_link() {
        let (connector, mut servers) = PipeConnector::with_links(1);
        let mut harness = Harness::start(connector, config());
        servers[0].accept_auth("s").await;
        harness.expect_connected().await;

        let _ = servers[0]
            .replies
            .send(Ok(Frame::Payload(Bytes::from_static(b"not json"))));
        servers[0].send_json(json!({"jsonrpc": "2.0", "method": "ping"}));
        let _ = servers[0]
            .replies
            .send(Ok(Frame::Error("ERR overloaded".into())));

        assert!(matches!(
            harness.next_event().await,
            SnapperEvent::Error(SnapperError::Parse(_))
        ));
        assert!(matches!(
            harness.next_event().await,
            SnapperEvent::Error(SnapperError::UnhandledMessage { ref method }) if method == "ping"
        ));
        assert!(matches!(
            harness.next_event().await,
            SnapperEvent::Error(SnapperError::Server(ref line)) if line == "ERR overloaded"
        ));
        assert_eq!(harness.state(), ConnectionState::Authenticated);

        harness.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stray_invalidation_codes_are_only_warnings() {
        let (connector, mut servers) = PipeConnector::with_links(1);
        let mut harness = Harness::start(connector, config());
        servers[0].accept_auth("s").await;
        harness.expect_connected().await;

        servers[0].reply_error(&json!(999), 400);
        servers[0].send_json(json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {"code": 400, "message": "session expired"}
        }));

        for _ in 0..2 {
            match harness.next_event().await {
                SnapperEvent::Warn(Incoming::Failure { error, .. }) => assert_eq!(error.code, 400),
                other => panic!("expected Warn, got {other:?}"),
            }
        }
        assert_eq!(harness.state(), ConnectionState::Authenticated);

        // Same link, no re-auth.
        let rx = harness.request("subscribe", vec![json!("lobby"), json!("c1")]);
        let sub = servers[0].next_request().await;
        assert_eq!(sub["method"], "subscribe");
        servers[0].reply(&sub["id"], json!("ok"));
        assert_eq!(rx.await.unwrap().unwrap(), json!("ok"));

        harness.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_reports_discarded_messages() {
        let (connector, mut servers) = PipeConnector::with_links(1);
        let mut harness = Harness::start(connector, config());
        servers[0].next_request().await;

        harness.publish("news", json!(1));
        harness.publish("news", json!(2));
        settle().await;
        harness.shutdown().await;

        assert!(matches!(
            harness.next_event().await,
            SnapperEvent::Error(SnapperError::MessagesDropped { count: 2 })
        ));
        assert!(matches!(harness.next_event().await, SnapperEvent::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_command_sender_closes_the_connection() {
        let (connector, mut servers) = PipeConnector::with_links(1);
        let Harness {
            cmd_tx,
            shutdown_tx,
            mut events,
            task,
            ..
        } = Harness::start(connector, config());
        servers[0].accept_auth("s").await;
        assert!(matches!(
            events.recv().await,
            Some(SnapperEvent::Connected { .. })
        ));

        drop(cmd_tx);
        task.await.unwrap();
        assert!(matches!(events.recv().await, Some(SnapperEvent::Closed)));
        drop(shutdown_tx);
    }
}
