//! # Basic Producer Example
//!
//! Demonstrates a complete Snapper producer lifecycle:
//!
//! 1. Connect to a Snapper server over TCP and authenticate with a signed token
//! 2. Subscribe a consumer to a room
//! 3. Publish a message to that room once per second
//! 4. Shut down gracefully on Ctrl+C or when the client gives up
//!
//! ## Running
//!
//! ```sh
//! # Start a Snapper server on 127.0.0.1:7701, then:
//! SNAPPER_SECRET=my-secret cargo run --example basic_producer
//!
//! # Override the server address:
//! SNAPPER_HOST=10.0.0.5 SNAPPER_PORT=7701 cargo run --example basic_producer
//! ```

use std::time::Duration;

use serde_json::json;
use snapper_producer::{ClientConfig, SnapperClient, SnapperEvent};

/// Default port when `SNAPPER_PORT` is not set.
const DEFAULT_PORT: u16 = 7701;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Initialize tracing. Set `RUST_LOG=debug` for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let host = std::env::var("SNAPPER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = match std::env::var("SNAPPER_PORT") {
        Ok(port) => port.parse()?,
        Err(_) => DEFAULT_PORT,
    };
    let secret = std::env::var("SNAPPER_SECRET").unwrap_or_else(|_| "change-me".to_string());

    let config = ClientConfig::new(port, "example-producer", vec![secret]).with_host(host);
    tracing::info!("Connecting to {}:{}", config.host, config.port);

    // Spawns the connection task; it connects, authenticates and reconnects
    // on its own.
    let (client, mut event_rx) = SnapperClient::connect(config)?;

    // A consumer needs a token of its own before it can subscribe. The
    // producer can mint one with the same secret.
    let mut claims = serde_json::Map::new();
    claims.insert("userId".into(), json!("consumer-1"));
    let consumer_token = client.sign_auth(claims)?;
    tracing::info!("Consumer token: {consumer_token}");

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut sequence = 0u64;
    let mut joined = false;

    // ── Event loop ──────────────────────────────────────────────────
    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else {
                    tracing::info!("Event channel closed, exiting");
                    break;
                };

                match event {
                    SnapperEvent::Connected { session_id } => {
                        tracing::info!("Authenticated, session {session_id:?}");
                        if !joined {
                            let answer = client.join_room("ticker", "consumer-1").await?;
                            tracing::info!("Joined room: {answer}");
                            joined = true;
                        }
                    }
                    SnapperEvent::Reconnecting { delay, attempts } => {
                        tracing::warn!("Reconnecting (attempt {attempts}) after {delay:?}");
                    }
                    SnapperEvent::Error(err) => {
                        tracing::error!("Client error: {err}");
                    }
                    SnapperEvent::Closed => {
                        tracing::warn!("Client closed");
                        break;
                    }
                    other => {
                        tracing::debug!("Event: {other:?}");
                    }
                }
            }

            _ = ticker.tick() => {
                sequence += 1;
                client.send_message("ticker", json!({ "seq": sequence }))?;
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down…");
                break;
            }
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────────
    client.close().await;
    tracing::info!("Client closed after {sequence} message(s). Goodbye!");
    Ok(())
}
