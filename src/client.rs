//! Async producer client for the Snapper protocol.
//!
//! [`SnapperClient`] is a thin handle that communicates with a background
//! connection task via an unbounded MPSC channel. Events are emitted on a
//! bounded channel ([`tokio::sync::mpsc::Receiver<SnapperEvent>`]) returned
//! from [`SnapperClient::start`].
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), snapper_producer::SnapperError> {
//! use snapper_producer::{ClientConfig, SnapperClient, SnapperEvent};
//!
//! let config = ClientConfig::new(7701, "producer-1", vec!["secret".into()]);
//! let (client, mut events) = SnapperClient::connect(config)?;
//!
//! client.send_message("lobby", "hello")?;
//! let joined = client.join_room("lobby", "consumer-1").await?;
//! println!("subscribed: {joined}");
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SnapperEvent::Connected { session_id } => println!("session {session_id:?}"),
//!         SnapperEvent::Closed => break,
//!         _ => {}
//!     }
//! }
//! client.close().await;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::Algorithm;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, warn};

use crate::auth::{self, JwtSigner, TokenIssuer, TokenSigner};
use crate::backoff::BackoffPolicy;
use crate::connection::{Command, Connection, ConnectionState, SharedState};
use crate::error::{Result, SnapperError};
use crate::event::{EventSink, SnapperEvent};
use crate::protocol::{METHOD_SUBSCRIBE, METHOD_UNSUBSCRIBE};
use crate::registry::Reply;
use crate::transport::Connector;

/// Host used when none is configured.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Maximum number of messages carried by one `publish` command.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Live commands above which queued messages are held back.
pub const DEFAULT_RPC_HIGH_WATER: usize = 100;

/// Time a command may wait for its response.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(60);

/// Error code that signals an invalidated session.
pub const DEFAULT_SESSION_INVALIDATION_CODE: i64 = 400;

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`SnapperClient`].
///
/// `port`, `producer_id` and at least one secret key are required; all other
/// fields have defaults.
///
/// # Example
///
/// ```
/// use snapper_producer::ClientConfig;
///
/// let config = ClientConfig::new(7701, "producer-1", vec!["secret".into()]);
/// assert_eq!(config.host, "127.0.0.1");
/// assert_eq!(config.batch_size, 50);
/// assert!(config.validate().is_ok());
/// ```
///
/// # Tuning
///
/// ```
/// use snapper_producer::{BackoffPolicy, ClientConfig};
/// use std::time::Duration;
///
/// let config = ClientConfig::new(7701, "producer-1", vec!["secret".into()])
///     .with_host("snapper.internal")
///     .with_rpc_timeout(Duration::from_secs(10))
///     .with_backoff(BackoffPolicy {
///         max_attempts: 5,
///         ..BackoffPolicy::default()
///     });
/// ```
#[derive(Clone)]
pub struct ClientConfig {
    /// Server host name or address.
    ///
    /// Defaults to **127.0.0.1**.
    pub host: String,
    /// Server TCP port. Must be non-zero.
    pub port: u16,
    /// Producer identity placed in the `producerId` claim.
    pub producer_id: String,
    /// Signing secrets. The first one signs every token.
    pub secret_keys: Vec<String>,
    /// Lifetime of each auth token.
    ///
    /// Defaults to **2 days**. Values of one minute or less fall back to the
    /// default; fractional seconds are dropped.
    pub expires_in: Duration,
    /// HMAC algorithm for the token header.
    ///
    /// Defaults to **HS256**.
    pub algorithm: Algorithm,
    /// Messages per `publish` command.
    ///
    /// Defaults to **50**.
    pub batch_size: usize,
    /// Live commands at which queued messages stop being drained.
    ///
    /// Defaults to **100**.
    pub rpc_high_water: usize,
    /// Per-command response timeout.
    ///
    /// Defaults to **60 seconds**.
    pub rpc_timeout: Duration,
    /// Reconnect backoff.
    pub backoff: BackoffPolicy,
    /// Error codes that, on an authenticated link, force a reconnect instead
    /// of failing the command. Empty disables the behavior.
    ///
    /// Defaults to **`[400]`**.
    pub session_invalidation_codes: Vec<i64>,
    /// Capacity of the bounded event channel.
    ///
    /// When the consumer cannot keep up, events are dropped (with a warning
    /// logged) to avoid blocking the connection task. The `Closed` event is
    /// always delivered regardless of capacity.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Timeout for the graceful shutdown.
    ///
    /// When [`SnapperClient::close`] is called, the connection task is given
    /// this much time to fail pending commands, close the transport and emit
    /// `Closed`. If the timeout expires the task is aborted.
    ///
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
}

impl ClientConfig {
    /// Create a configuration with the required fields and default values.
    pub fn new(port: u16, producer_id: impl Into<String>, secret_keys: Vec<String>) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port,
            producer_id: producer_id.into(),
            secret_keys,
            expires_in: auth::DEFAULT_EXPIRES_IN,
            algorithm: Algorithm::HS256,
            batch_size: DEFAULT_BATCH_SIZE,
            rpc_high_water: DEFAULT_RPC_HIGH_WATER,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            backoff: BackoffPolicy::default(),
            session_invalidation_codes: vec![DEFAULT_SESSION_INVALIDATION_CODE],
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Set the server host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the token lifetime. See [`expires_in`](Self::expires_in).
    #[must_use]
    pub fn with_expires_in(mut self, expires_in: Duration) -> Self {
        self.expires_in = auth::normalize_expires_in(expires_in);
        self
    }

    /// Set the token signing algorithm.
    #[must_use]
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Set the maximum number of messages per `publish` command.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the in-flight command high-water mark.
    #[must_use]
    pub fn with_rpc_high_water(mut self, high_water: usize) -> Self {
        self.rpc_high_water = high_water;
        self
    }

    /// Set the per-command response timeout.
    #[must_use]
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Set the reconnect backoff policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the error codes that force a reconnect on an authenticated link.
    #[must_use]
    pub fn with_session_invalidation_codes(mut self, codes: Vec<i64>) -> Self {
        self.session_invalidation_codes = codes;
        self
    }

    /// Set the capacity of the bounded event channel.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Set the timeout for the graceful shutdown.
    ///
    /// A zero timeout aborts the connection task immediately.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Check the configuration without doing any I/O.
    ///
    /// # Errors
    ///
    /// Returns [`SnapperError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(SnapperError::InvalidConfig(msg.to_string()));
        if self.port == 0 {
            return invalid("port must be a non-zero TCP port");
        }
        if self.host.trim().is_empty() {
            return invalid("host must not be empty");
        }
        if self.producer_id.is_empty() {
            return invalid("producer_id must be a non-empty string");
        }
        match self.secret_keys.first() {
            None => return invalid("secret_keys must contain at least one key"),
            Some(key) if key.is_empty() => return invalid("the first secret key is empty"),
            Some(_) => {}
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1");
        }
        if self.rpc_high_water == 0 {
            return invalid("rpc_high_water must be at least 1");
        }
        if self.rpc_timeout.is_zero() {
            return invalid("rpc_timeout must be positive");
        }
        let growth = self.backoff.growth_factor;
        if !growth.is_finite() || growth < 1.0 {
            return invalid("backoff growth_factor must be a finite number >= 1");
        }
        Ok(())
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("producer_id", &self.producer_id)
            .field("secret_keys", &format_args!("[{} redacted]", self.secret_keys.len()))
            .field("expires_in", &self.expires_in)
            .field("algorithm", &self.algorithm)
            .field("batch_size", &self.batch_size)
            .field("rpc_high_water", &self.rpc_high_water)
            .field("rpc_timeout", &self.rpc_timeout)
            .field("backoff", &self.backoff)
            .field("session_invalidation_codes", &self.session_invalidation_codes)
            .field("event_channel_capacity", &self.event_channel_capacity)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

// ── Client handle ───────────────────────────────────────────────────

/// Async client handle for the Snapper protocol.
///
/// Created via [`SnapperClient::start`], which spawns a background connection
/// task and returns this handle together with an event receiver. The task
/// connects, authenticates and keeps reconnecting on its own; the handle only
/// submits work.
pub struct SnapperClient {
    /// Sender half of the command channel to the connection task.
    cmd_tx: mpsc::UnboundedSender<Command>,
    /// Shared state updated by the connection task.
    shared: Arc<SharedState>,
    /// Signs tokens for [`sign_auth`](Self::sign_auth).
    tokens: TokenIssuer,
    /// Handle to the background connection task.
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Oneshot sender to signal the connection task to shut down gracefully.
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    /// Timeout for the graceful shutdown.
    shutdown_timeout: Duration,
}

impl SnapperClient {
    /// Start the connection task and return a handle plus event receiver.
    ///
    /// Tokens are signed with a [`JwtSigner`] keyed by the first secret in
    /// `config.secret_keys`. Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SnapperError::InvalidConfig`] if the configuration is rejected.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn start(
        connector: impl Connector,
        config: ClientConfig,
    ) -> Result<(Self, mpsc::Receiver<SnapperEvent>)> {
        config.validate()?;
        let secret = config
            .secret_keys
            .first()
            .ok_or_else(|| SnapperError::InvalidConfig("missing secret key".into()))?;
        let signer = JwtSigner::new(secret.as_bytes(), config.algorithm)?;
        Self::start_with_signer(connector, signer, config)
    }

    /// Like [`start`](Self::start), with a custom token signer. `secret_keys`
    /// and `algorithm` are still validated but otherwise unused.
    ///
    /// # Errors
    ///
    /// Returns [`SnapperError::InvalidConfig`] if the configuration is rejected.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn start_with_signer(
        connector: impl Connector,
        signer: impl TokenSigner,
        config: ClientConfig,
    ) -> Result<(Self, mpsc::Receiver<SnapperEvent>)> {
        config.validate()?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        // Clamp capacity to at least 1 (tokio panics on 0).
        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel::<SnapperEvent>(capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let tokens = TokenIssuer::new(
            Arc::new(signer),
            config.producer_id.clone(),
            auth::normalize_expires_in(config.expires_in),
        );
        let shared = Arc::new(SharedState::new());
        let connection = Connection::new(
            Arc::new(connector),
            tokens.clone(),
            &config,
            EventSink::new(event_tx),
            Arc::clone(&shared),
        );
        let task = tokio::spawn(connection.run(cmd_rx, shutdown_rx));

        let client = Self {
            cmd_tx,
            shared,
            tokens,
            task: Mutex::new(Some(task)),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_timeout: config.shutdown_timeout,
        };

        Ok((client, event_rx))
    }

    /// Start a client that connects over TCP to `config.host:config.port`.
    ///
    /// # Errors
    ///
    /// Returns [`SnapperError::InvalidConfig`] if the configuration is rejected.
    #[cfg(feature = "transport-tcp")]
    #[must_use = "the event receiver must be used to receive events"]
    pub fn connect(config: ClientConfig) -> Result<(Self, mpsc::Receiver<SnapperEvent>)> {
        let connector = crate::transports::TcpConnector::new(config.host.clone(), config.port);
        Self::start(connector, config)
    }

    // ── Public API methods ──────────────────────────────────────────

    /// Queue a fire-and-forget message for `room`.
    ///
    /// Returns once the message is queued. Messages are published in batches
    /// when the connection is authenticated; failures surface only as
    /// [`SnapperEvent::Error`].
    ///
    /// # Errors
    ///
    /// Returns [`SnapperError::InvalidArgument`] for an empty room,
    /// [`SnapperError::Serialization`] if `message` cannot be serialized, and
    /// [`SnapperError::Closed`] once the client is closed.
    pub fn send_message(&self, room: impl Into<String>, message: impl Serialize) -> Result<()> {
        let room = non_empty("room", room.into())?;
        let message = serde_json::to_value(message)?;
        self.submit(Command::Publish { room, message })
    }

    /// Subscribe `consumer_id` to `room` and wait for the server's answer.
    ///
    /// # Errors
    ///
    /// Returns [`SnapperError::InvalidArgument`] for empty ids, or any error
    /// [`request`](Self::request) may return.
    pub async fn join_room(
        &self,
        room: impl Into<String>,
        consumer_id: impl Into<String>,
    ) -> Result<Value> {
        let params = room_params(room.into(), consumer_id.into())?;
        self.request(METHOD_SUBSCRIBE, params).await
    }

    /// Unsubscribe `consumer_id` from `room` and wait for the server's answer.
    ///
    /// # Errors
    ///
    /// Returns [`SnapperError::InvalidArgument`] for empty ids, or any error
    /// [`request`](Self::request) may return.
    pub async fn leave_room(
        &self,
        room: impl Into<String>,
        consumer_id: impl Into<String>,
    ) -> Result<Value> {
        let params = room_params(room.into(), consumer_id.into())?;
        self.request(METHOD_UNSUBSCRIBE, params).await
    }

    /// Issue an RPC and wait for its result.
    ///
    /// The command is written as soon as the connection is authenticated and
    /// replayed after reconnects until it completes.
    ///
    /// # Errors
    ///
    /// Returns [`SnapperError::Rpc`] if the server answers with an error,
    /// [`SnapperError::Timeout`] if no answer arrives within `rpc_timeout`,
    /// and [`SnapperError::Closed`] if the client closes first.
    pub async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.submit(Command::Request {
            method: non_empty("method", method.to_string())?,
            params,
            reply: Reply::Caller(tx),
        })?;
        rx.await.map_err(|_| SnapperError::Closed)?
    }

    /// Issue an RPC without waiting. The outcome arrives as
    /// [`SnapperEvent::Jsonrpc`] or [`SnapperEvent::Error`].
    ///
    /// # Errors
    ///
    /// Returns [`SnapperError::InvalidArgument`] for an empty method and
    /// [`SnapperError::Closed`] once the client is closed.
    pub fn request_detached(&self, method: &str, params: Vec<Value>) -> Result<()> {
        self.submit(Command::Request {
            method: non_empty("method", method.to_string())?,
            params,
            reply: Reply::Detached,
        })
    }

    /// Sign arbitrary claims with this client's signer, adding `exp`.
    ///
    /// Useful for issuing consumer tokens (for example a `userId` claim)
    /// from the producer side.
    ///
    /// # Errors
    ///
    /// Returns [`SnapperError::Signing`] if the signer fails.
    pub fn sign_auth(&self, claims: Map<String, Value>) -> Result<String> {
        self.tokens.sign(claims)
    }

    /// Close the client, failing pending commands and stopping the connection
    /// task. Calling it again is a no-op.
    ///
    /// Takes `&self` so it can run while requests on the same handle are
    /// still awaiting; they complete with [`SnapperError::Closed`]. After
    /// calling this method, the event receiver yields `Closed` (unless the
    /// task had to be aborted) and then `None`.
    pub async fn close(&self) {
        debug!("SnapperClient: close requested");
        self.shared.closed.store(true, Ordering::Release);

        // Signal the connection task to shut down gracefully.
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }

        // Await the connection task with a timeout. If it doesn't exit in
        // time, abort it so the task cannot detach and run indefinitely.
        let task = self.task.lock().await.take();
        if let Some(mut task) = task {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("connection task terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("connection task did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("connection task aborted: {join_err}");
                    }
                }
            }
        }
        self.shared.state.send_replace(ConnectionState::Closed);
    }

    // ── State accessors ─────────────────────────────────────────────

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Returns `true` once the client is closed, by [`close`](Self::close) or
    /// by the connection task giving up.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Session id returned by the server for the current authenticated link.
    pub async fn session_id(&self) -> Option<String> {
        self.shared.session_id.lock().await.clone()
    }

    // ── Internal helpers ────────────────────────────────────────────

    /// Queue a command to the connection task.
    fn submit(&self, cmd: Command) -> Result<()> {
        if self.is_closed() {
            return Err(SnapperError::Closed);
        }
        self.cmd_tx.send(cmd).map_err(|_| SnapperError::Closed)
    }
}

impl std::fmt::Debug for SnapperClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapperClient")
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .field(
                "has_task",
                &self.task.try_lock().map(|task| task.is_some()).unwrap_or(true),
            )
            .finish()
    }
}

impl Drop for SnapperClient {
    fn drop(&mut self) {
        // `Drop` is synchronous, so a graceful close cannot be awaited here.
        // Aborting drops the connection task and with it the transport and
        // every pending reply sender, which callers observe as `Closed`.
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

fn non_empty(field: &str, value: String) -> Result<String> {
    if value.is_empty() {
        return Err(SnapperError::InvalidArgument(format!(
            "{field} must be a non-empty string"
        )));
    }
    Ok(value)
}

fn room_params(room: String, consumer_id: String) -> Result<Vec<Value>> {
    Ok(vec![
        Value::String(non_empty("room", room)?),
        Value::String(non_empty("consumer_id", consumer_id)?),
    ])
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
    use crate::codec::Frame;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::AtomicBool;

    fn config() -> ClientConfig {
        ClientConfig::new(7701, "producer-1", vec!["secret".to_string()])
    }

    /// Connector that never reaches a server.
    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(&self) -> std::result::Result<Box<dyn Transport>, SnapperError> {
            Err(SnapperError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            )))
        }
    }

    /// Transport that hangs forever in `close()` so the shutdown timeout and
    /// abort path can be tested.
    struct HangingCloseTransport {
        close_called: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport for HangingCloseTransport {
        async fn send(&mut self, _frame: Bytes) -> std::result::Result<(), SnapperError> {
            Ok(())
        }

        async fn recv(&mut self) -> Option<std::result::Result<Frame, SnapperError>> {
            std::future::pending().await
        }

        async fn close(&mut self) -> std::result::Result<(), SnapperError> {
            self.close_called.store(true, Ordering::Release);
            std::future::pending().await
        }
    }

    struct HangingConnector {
        close_called: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Connector for HangingConnector {
        async fn connect(&self) -> std::result::Result<Box<dyn Transport>, SnapperError> {
            Ok(Box::new(HangingCloseTransport {
                close_called: Arc::clone(&self.close_called),
            }))
        }
    }

    #[test]
    fn config_defaults() {
        let config = config();
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, 7701);
        assert_eq!(config.expires_in, Duration::from_secs(172_800));
        assert_eq!(config.algorithm, Algorithm::HS256);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.rpc_high_water, 100);
        assert_eq!(config.rpc_timeout, Duration::from_secs(60));
        assert_eq!(config.backoff, BackoffPolicy::default());
        assert_eq!(config.session_invalidation_codes, vec![400]);
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
    }

    #[test]
    fn config_builder_methods() {
        let config = config()
            .with_host("10.0.0.5")
            .with_expires_in(Duration::from_secs(600))
            .with_algorithm(Algorithm::HS384)
            .with_batch_size(10)
            .with_rpc_high_water(5)
            .with_rpc_timeout(Duration::from_secs(3))
            .with_event_channel_capacity(0)
            .with_shutdown_timeout(Duration::from_millis(250));
        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.expires_in, Duration::from_secs(600));
        assert_eq!(config.algorithm, Algorithm::HS384);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.rpc_high_water, 5);
        assert_eq!(config.rpc_timeout, Duration::from_secs(3));
        assert_eq!(config.event_channel_capacity, 1);
        assert_eq!(config.shutdown_timeout, Duration::from_millis(250));
    }

    #[test]
    fn short_token_lifetime_uses_default() {
        let config = config().with_expires_in(Duration::from_secs(30));
        assert_eq!(config.expires_in, auth::DEFAULT_EXPIRES_IN);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let cases = [
            ClientConfig::new(0, "p", vec!["s".into()]),
            ClientConfig::new(7701, "", vec!["s".into()]),
            ClientConfig::new(7701, "p", vec![]),
            ClientConfig::new(7701, "p", vec![String::new()]),
            config().with_host(" "),
            config().with_batch_size(0),
            config().with_rpc_high_water(0),
            config().with_rpc_timeout(Duration::ZERO),
            config().with_backoff(BackoffPolicy {
                growth_factor: 0.5,
                ..BackoffPolicy::default()
            }),
        ];
        for config in cases {
            let err = config.validate().unwrap_err();
            assert!(matches!(err, SnapperError::InvalidConfig(_)), "{config:?}");
        }
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = ClientConfig::new(7701, "p", vec!["hunter2".into()]);
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("redacted"));
    }

    #[tokio::test]
    async fn start_rejects_invalid_config_synchronously() {
        let result = SnapperClient::start(RefusingConnector, config().with_batch_size(0));
        assert!(matches!(result, Err(SnapperError::InvalidConfig(_))));

        let result =
            SnapperClient::start(RefusingConnector, config().with_algorithm(Algorithm::ES256));
        assert!(matches!(result, Err(SnapperError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn argument_validation_happens_before_submission() {
        let (client, _events) = SnapperClient::start(RefusingConnector, config()).unwrap();

        assert!(matches!(
            client.send_message("", "hi"),
            Err(SnapperError::InvalidArgument(_))
        ));
        assert!(matches!(
            client.join_room("lobby", "").await,
            Err(SnapperError::InvalidArgument(_))
        ));
        assert!(matches!(
            client.leave_room("", "c1").await,
            Err(SnapperError::InvalidArgument(_))
        ));
        assert!(matches!(
            client.request_detached("", vec![]),
            Err(SnapperError::InvalidArgument(_))
        ));

        client.close().await;
    }

    #[tokio::test]
    async fn operations_fail_fast_after_close() {
        let (client, mut events) = SnapperClient::start(RefusingConnector, config()).unwrap();
        client.send_message("lobby", "queued").unwrap();

        client.close().await;
        client.close().await;

        assert!(client.is_closed());
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(
            client.send_message("lobby", "late"),
            Err(SnapperError::Closed)
        ));
        assert!(matches!(
            client.request("subscribe", vec![]).await,
            Err(SnapperError::Closed)
        ));

        let mut saw_closed = false;
        while let Some(event) = events.recv().await {
            saw_closed = matches!(event, SnapperEvent::Closed);
        }
        assert!(saw_closed, "Closed must be the last event");
    }

    #[tokio::test]
    async fn pending_request_fails_when_client_closes() {
        let (client, _events) = SnapperClient::start(RefusingConnector, config()).unwrap();
        let shared = Arc::clone(&client.shared);

        let (tx, rx) = oneshot::channel();
        client
            .submit(Command::Request {
                method: "subscribe".into(),
                params: vec![],
                reply: Reply::Caller(tx),
            })
            .unwrap();
        client.close().await;

        assert!(matches!(rx.await.unwrap(), Err(SnapperError::Closed)));
        assert!(shared.closed.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn sign_auth_adds_expiry() {
        let (client, _events) = SnapperClient::start(RefusingConnector, config()).unwrap();
        let mut claims = Map::new();
        claims.insert("userId".into(), Value::from("u-1"));

        let token = client.sign_auth(claims).unwrap();
        let mut validation = jsonwebtoken::Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        let decoded = jsonwebtoken::decode::<Map<String, Value>>(
            &token,
            &jsonwebtoken::DecodingKey::from_secret(b"secret"),
            &validation,
        )
        .unwrap();
        assert_eq!(decoded.claims["userId"], "u-1");
        assert!(decoded.claims["exp"].as_u64().is_some());

        client.close().await;
    }

    #[tokio::test]
    async fn close_aborts_task_that_hangs() {
        let close_called = Arc::new(AtomicBool::new(false));
        let connector = HangingConnector {
            close_called: Arc::clone(&close_called),
        };
        let (client, _events) = SnapperClient::start(
            connector,
            config().with_shutdown_timeout(Duration::from_millis(50)),
        )
        .unwrap();

        // Wait until the task has a transport to close.
        let mut states = client.watch_state();
        states
            .wait_for(|state| *state == ConnectionState::Connected)
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        client.close().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(close_called.load(Ordering::Acquire));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn dropping_the_client_aborts_the_task() {
        let (client, mut events) = SnapperClient::start(RefusingConnector, config()).unwrap();
        drop(client);
        // The aborted task drops the event sender, ending the stream.
        while events.recv().await.is_some() {}
    }
}
