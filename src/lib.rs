//! # Snapper Producer
//!
//! Async Rust producer client for the Snapper TCP RPC/pub-sub protocol.
//!
//! A producer authenticates with a signed token, publishes fire-and-forget
//! messages to named rooms, and issues request/response RPCs over a single
//! persistent connection. Lost connections are re-established with capped
//! exponential backoff, and every command the server has not answered is
//! replayed in order after re-authentication.
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement [`Connector`] and [`Transport`] for any
//!   byte stream; the default `transport-tcp` feature provides [`TcpConnector`]
//! - **Backpressure**: queued messages are batched into `publish` commands
//!   and held back while too many commands are in flight
//! - **Event-driven**: receive typed [`SnapperEvent`]s via a channel
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), snapper_producer::SnapperError> {
//! use snapper_producer::{ClientConfig, SnapperClient};
//!
//! let config = ClientConfig::new(7701, "producer-1", vec!["secret".into()]);
//! let (client, _events) = SnapperClient::connect(config)?;
//! client.send_message("news", serde_json::json!({"headline": "hi"}))?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod backoff;
pub mod client;
pub mod codec;
mod connection;
pub mod error;
pub mod error_codes;
pub mod event;
pub mod protocol;
mod queue;
mod registry;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use auth::{JwtSigner, TokenSigner};
pub use backoff::BackoffPolicy;
pub use client::{ClientConfig, SnapperClient};
pub use connection::ConnectionState;
pub use error::{Result, SnapperError};
pub use error_codes::ErrorCode;
pub use event::SnapperEvent;
pub use jsonwebtoken::Algorithm;
pub use protocol::Incoming;
pub use transport::{Connector, Transport};

#[cfg(feature = "transport-tcp")]
pub use transports::{TcpConnector, TcpTransport};
