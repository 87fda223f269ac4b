#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for Snapper client integration tests.
//!
//! Provides a [`MockServer`] that speaks the Snapper wire format over a real
//! loopback TCP socket, plus helpers for configs, events and tokens.

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Map, Value};
use snapper_producer::codec::{self, Frame, FrameDecoder};
use snapper_producer::{BackoffPolicy, ClientConfig, SnapperEvent};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

/// Upper bound for any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(5);

/// Secret used by [`config`].
pub const SECRET: &str = "test-secret";

// ── MockServer ──────────────────────────────────────────────────────

/// A Snapper server stand-in listening on an ephemeral loopback port.
pub struct MockServer {
    listener: TcpListener,
    pub port: u16,
}

impl MockServer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self { listener, port }
    }

    /// Accept the next client connection.
    pub async fn accept(&self) -> ServerConn {
        let (stream, _) = tokio::time::timeout(WAIT, self.listener.accept())
            .await
            .expect("timed out waiting for the client to connect")
            .unwrap();
        let (read, write) = stream.into_split();
        ServerConn {
            reader: FramedRead::new(read, FrameDecoder::default()),
            writer: write,
        }
    }
}

/// One accepted client connection, seen from the server.
pub struct ServerConn {
    reader: FramedRead<OwnedReadHalf, FrameDecoder>,
    writer: OwnedWriteHalf,
}

impl ServerConn {
    /// Read the next JSON-RPC request.
    pub async fn next_request(&mut self) -> Value {
        let frame = tokio::time::timeout(WAIT, self.reader.next())
            .await
            .expect("timed out waiting for a request")
            .expect("client closed the connection")
            .unwrap();
        match frame {
            Frame::Payload(payload) => serde_json::from_slice(&payload).unwrap(),
            other => panic!("unexpected frame from client: {other:?}"),
        }
    }

    /// Returns `true` if no request arrives within `window`.
    pub async fn is_quiet_for(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.reader.next()).await.is_err()
    }

    /// Returns `true` once the client has closed its side.
    pub async fn closed_by_client(&mut self) -> bool {
        matches!(
            tokio::time::timeout(WAIT, self.reader.next()).await,
            Ok(None | Some(Err(_)))
        )
    }

    pub async fn send_json(&mut self, value: Value) {
        let bytes = codec::frame(&serde_json::to_vec(&value).unwrap());
        self.write_raw(&bytes).await;
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn reply(&mut self, id: &Value, result: Value) {
        self.send_json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
            .await;
    }

    pub async fn reply_error(&mut self, id: &Value, code: i64, message: &str) {
        self.send_json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message}
        }))
        .await;
    }

    /// Read the `auth` request and accept it, returning the request.
    pub async fn accept_auth(&mut self, session_id: &str) -> Value {
        let auth = self.next_request().await;
        assert_eq!(auth["method"], "auth", "first request must be auth: {auth}");
        self.reply(&auth["id"], json!({"id": session_id})).await;
        auth
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Client config pointing at `port` with fast reconnects.
pub fn config(port: u16) -> ClientConfig {
    ClientConfig::new(port, "producer-1", vec![SECRET.to_string()])
        .with_backoff(BackoffPolicy {
            initial_delay: Duration::from_millis(20),
            growth_factor: 1.2,
            max_delay: Duration::from_millis(100),
            max_attempts: 50,
        })
        .with_shutdown_timeout(Duration::from_secs(2))
}

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Wait for the next event.
pub async fn next_event(events: &mut mpsc::Receiver<SnapperEvent>) -> SnapperEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Wait for the next `Connected` event, skipping nothing.
pub async fn expect_connected(events: &mut mpsc::Receiver<SnapperEvent>) -> Option<String> {
    match next_event(events).await {
        SnapperEvent::Connected { session_id } => session_id,
        other => panic!("expected Connected, got {other:?}"),
    }
}

/// Decode an auth token signed with [`SECRET`].
pub fn decode_token(token: &str) -> (jsonwebtoken::Header, Map<String, Value>) {
    let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
    validation.required_spec_claims.clear();
    let data = jsonwebtoken::decode::<Map<String, Value>>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(SECRET.as_bytes()),
        &validation,
    )
    .unwrap();
    (data.header, data.claims)
}
