//! Transport abstraction for the Snapper protocol.
//!
//! A [`Transport`] is one established, bidirectional frame channel to the
//! server. A [`Connector`] opens a fresh transport on demand; the client asks
//! it for a new one on every reconnect, so connection parameters (host and
//! port for TCP, an in-memory pipe in tests) live in the connector rather
//! than in the client.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use bytes::Bytes;
//! use snapper_producer::codec::Frame;
//! use snapper_producer::error::SnapperError;
//! use snapper_producer::transport::{Connector, Transport};
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, frame: Bytes) -> Result<(), SnapperError> {
//!         // Write the already-framed bytes
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<Frame, SnapperError>> {
//!         // Return the next decoded frame, or None once the peer closed
//!         todo!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), SnapperError> {
//!         todo!()
//!     }
//! }
//!
//! struct MyConnector;
//!
//! #[async_trait]
//! impl Connector for MyConnector {
//!     async fn connect(&self) -> Result<Box<dyn Transport>, SnapperError> {
//!         Ok(Box::new(MyTransport { /* ... */ }))
//!     }
//! }
//! ```

use async_trait::async_trait;
use bytes::Bytes;

use crate::codec::Frame;
use crate::error::SnapperError;

/// A bidirectional frame transport for the Snapper protocol.
///
/// Outbound data is handed over already framed (see
/// [`codec::frame`](crate::codec::frame)); inbound data is returned as decoded
/// [`Frame`]s, typically by wrapping the read side in a
/// [`FrameDecoder`](crate::codec::FrameDecoder).
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method **MUST** be cancel-safe because it is used
/// inside `tokio::select!`. If `recv` is cancelled before completion, calling it
/// again must not lose data. `FramedRead` and channel receivers are naturally
/// cancel-safe.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Write one complete frame.
    ///
    /// # Errors
    ///
    /// Returns [`SnapperError::TransportSend`] or [`SnapperError::Io`] if the
    /// frame could not be written. The client treats this as a lost link.
    async fn send(&mut self, frame: Bytes) -> Result<(), SnapperError>;

    /// Receive the next frame from the server.
    ///
    /// Returns:
    /// - `Some(Ok(frame))`: a complete frame was received
    /// - `Some(Err(e))`: a transport or framing error occurred
    /// - `None`: the connection was closed cleanly by the server
    ///
    /// # Cancel Safety
    ///
    /// This method **MUST** be cancel-safe (see [trait documentation](Transport)).
    async fn recv(&mut self) -> Option<Result<Frame, SnapperError>>;

    /// Close the transport connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the graceful shutdown fails. Implementations should
    /// still release resources even if the close handshake fails.
    async fn close(&mut self) -> Result<(), SnapperError>;
}

/// Opens transports to a Snapper server.
///
/// Called once at start and once per reconnect attempt. A failed connect is
/// retried with backoff.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a new transport.
    ///
    /// # Errors
    ///
    /// Any error is reported as an event and followed by a reconnect attempt.
    async fn connect(&self) -> Result<Box<dyn Transport>, SnapperError>;
}
