//! # Custom Transport Example
//!
//! Shows how to implement the [`Connector`] and [`Transport`] traits with a
//! simple in-process loopback channel. This is useful for:
//!
//! - **Testing**: exercise producer logic without a real server
//! - **Custom backends**: adapt any byte stream (TLS, QUIC, Unix sockets)
//!
//! ## Running
//!
//! ```sh
//! cargo run --example custom_transport
//! ```

use std::sync::Mutex;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde_json::{json, Value};
use snapper_producer::codec::{Frame, FrameDecoder};
use snapper_producer::{
    ClientConfig, Connector, SnapperClient, SnapperError, SnapperEvent, Transport,
};
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;

// ─────────────────────────────────────────────────────────────────────
// Step 1: Define a channel-based "loopback" transport
// ─────────────────────────────────────────────────────────────────────

/// The client half of the loopback. Outbound frames go to the server half
/// as raw bytes; inbound frames arrive already decoded.
pub struct LoopbackTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

/// The "server side" of the loopback. Use this to drive the conversation.
pub struct LoopbackServer {
    rx: mpsc::UnboundedReceiver<Bytes>,
    tx: mpsc::UnboundedSender<Frame>,
    decoder: FrameDecoder,
    buf: BytesMut,
}

impl LoopbackServer {
    /// Read the next JSON-RPC request the client wrote.
    async fn next_request(&mut self) -> Result<Value, Box<dyn std::error::Error>> {
        loop {
            if let Some(Frame::Payload(payload)) = self.decoder.decode(&mut self.buf)? {
                return Ok(serde_json::from_slice(&payload)?);
            }
            let Some(bytes) = self.rx.recv().await else {
                return Err("client closed the loopback".into());
            };
            self.buf.extend_from_slice(&bytes);
        }
    }

    /// Answer request `id` with `result`.
    fn reply(&self, id: &Value, result: Value) -> Result<(), Box<dyn std::error::Error>> {
        let body = json!({"jsonrpc": "2.0", "id": id, "result": result});
        self.tx
            .send(Frame::Payload(Bytes::from(serde_json::to_vec(&body)?)))
            .map_err(|_| "client dropped the loopback")?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: Implement the Transport trait
// ─────────────────────────────────────────────────────────────────────

#[async_trait]
impl Transport for LoopbackTransport {
    /// Forward an encoded frame to the server half.
    async fn send(&mut self, frame: Bytes) -> Result<(), SnapperError> {
        self.tx
            .send(frame)
            .map_err(|e| SnapperError::TransportSend(e.to_string()))
    }

    /// Returns `None` when the server half is dropped. This is how the
    /// client discovers that the connection has ended.
    ///
    /// This method is **cancel-safe** because `mpsc::UnboundedReceiver::recv`
    /// is cancel-safe.
    async fn recv(&mut self) -> Option<Result<Frame, SnapperError>> {
        self.rx.recv().await.map(Ok)
    }

    /// Close is a no-op for channels; dropping is sufficient.
    async fn close(&mut self) -> Result<(), SnapperError> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: Hand out links through a Connector
// ─────────────────────────────────────────────────────────────────────

/// Hands out a single pre-built link; later reconnects are refused.
struct LoopbackConnector {
    link: Mutex<Option<LoopbackTransport>>,
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, SnapperError> {
        let link = self
            .link
            .lock()
            .map_err(|_| SnapperError::TransportClosed)?
            .take()
            .ok_or(SnapperError::TransportClosed)?;
        Ok(Box::new(link))
    }
}

fn loopback() -> (LoopbackConnector, LoopbackServer) {
    // Client → Server channel
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    // Server → Client channel
    let (server_tx, client_rx) = mpsc::unbounded_channel();

    let connector = LoopbackConnector {
        link: Mutex::new(Some(LoopbackTransport {
            tx: client_tx,
            rx: client_rx,
        })),
    };
    let server = LoopbackServer {
        rx: server_rx,
        tx: server_tx,
        decoder: FrameDecoder::new(),
        buf: BytesMut::new(),
    };
    (connector, server)
}

// ─────────────────────────────────────────────────────────────────────
// Step 4: Wire together the client and the fake server
// ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for readable output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (connector, mut server) = loopback();
    let config = ClientConfig::new(7701, "loopback-producer", vec!["demo-secret".into()]);
    let (client, mut event_rx) = SnapperClient::start(connector, config)?;

    // Queued now, published once the fake server accepts the token.
    client.send_message("demo", json!({"hello": "world"}))?;

    // ── Fake server: accept auth, then acknowledge one publish ──────
    let auth = server.next_request().await?;
    tracing::info!("Server received: {auth}");
    server.reply(&auth["id"], json!({"id": "loopback-session"}))?;

    let publish = server.next_request().await?;
    tracing::info!(
        "Server received {} with {}",
        publish["method"],
        publish["params"]
    );
    server.reply(&publish["id"], json!("ok"))?;

    // ── Read events from the client ─────────────────────────────────
    // Expect Connected, then the detached publish result.
    while let Some(event) = event_rx.recv().await {
        match event {
            SnapperEvent::Connected { session_id } => {
                tracing::info!("Event: Connected, session {session_id:?}");
            }
            SnapperEvent::Jsonrpc { id, result } => {
                tracing::info!("Event: publish {id} acknowledged with {result}");
                break;
            }
            other => {
                tracing::info!("Event: {other:?}");
            }
        }
    }

    // ── Clean shutdown ──────────────────────────────────────────────
    client.close().await;
    tracing::info!("Done. Custom transport works!");
    Ok(())
}
