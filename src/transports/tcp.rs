//! TCP transport implementation.
//!
//! [`TcpTransport`] speaks the Snapper wire format directly over a
//! [`TcpStream`]: outbound frames are written as-is, inbound bytes are split
//! into frames by a [`FrameDecoder`]. [`TcpConnector`] opens a new
//! transport for every (re)connect.
//!
//! # Feature gate
//!
//! This module is only available when the `transport-tcp` feature is enabled
//! (it is enabled by default).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), snapper_producer::SnapperError> {
//! use snapper_producer::{codec, TcpTransport, Transport};
//!
//! let mut transport = TcpTransport::connect("127.0.0.1", 7701).await?;
//! transport.send(codec::frame(br#"{"jsonrpc":"2.0","id":1,"method":"auth","params":["t"]}"#)).await?;
//!
//! if let Some(Ok(frame)) = transport.recv().await {
//!     println!("received: {frame:?}");
//! }
//!
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;

use crate::codec::{CodecError, Frame, FrameDecoder};
use crate::error::SnapperError;
use crate::transport::{Connector, Transport};

/// A [`Transport`] backed by a TCP connection.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method is cancel-safe: partially received
/// frames stay buffered in the decoder until the next call.
#[derive(Debug)]
pub struct TcpTransport {
    reader: FramedRead<OwnedReadHalf, FrameDecoder>,
    writer: OwnedWriteHalf,
    closed: bool,
}

impl TcpTransport {
    /// Connect to `host:port` with `TCP_NODELAY` set.
    ///
    /// # Errors
    ///
    /// Returns [`SnapperError::Io`] if the connection cannot be established.
    pub async fn connect(host: &str, port: u16) -> Result<Self, SnapperError> {
        tracing::debug!(host, port, "connecting to Snapper server");
        let stream = TcpStream::connect((host, port)).await?;
        tracing::info!(host, port, "TCP connection established");
        Self::from_stream(stream)
    }

    /// Wrap an already-connected stream.
    ///
    /// # Errors
    ///
    /// Returns [`SnapperError::Io`] if `TCP_NODELAY` cannot be set.
    pub fn from_stream(stream: TcpStream) -> Result<Self, SnapperError> {
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: FramedRead::new(read, FrameDecoder::default()),
            writer: write,
            closed: false,
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, frame: Bytes) -> Result<(), SnapperError> {
        if self.closed {
            return Err(SnapperError::TransportClosed);
        }
        self.writer
            .write_all(&frame)
            .await
            .map_err(|e| SnapperError::TransportSend(e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| SnapperError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Frame, SnapperError>> {
        if self.closed {
            return None;
        }
        self.reader
            .next()
            .await
            .map(|frame| frame.map_err(receive_error))
    }

    async fn close(&mut self) -> Result<(), SnapperError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.shutdown().await.map_err(SnapperError::from)
    }
}

/// Socket read failures are transport errors; a desynced stream stays a
/// codec error.
fn receive_error(err: CodecError) -> SnapperError {
    match err {
        CodecError::Io(io) => SnapperError::TransportReceive(io.to_string()),
        desync @ CodecError::Desync(_) => SnapperError::Codec(desync),
    }
}

/// Opens a [`TcpTransport`] to a fixed address on every connect.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    connect_timeout: Option<Duration>,
}

impl TcpConnector {
    /// Create a connector for `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: None,
        }
    }

    /// Abort connection attempts that take longer than `timeout`.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, SnapperError> {
        let connect = TcpTransport::connect(&self.host, self.port);
        let transport = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect).await.map_err(|_| {
                SnapperError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {}:{} timed out", self.host, self.port),
                ))
            })??,
            None => connect.await?,
        };
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
#[cfg(feature = "transport-tcp")]
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
    use crate::codec;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn tcp_transport_is_send_and_debug() {
        fn assert_send<T: Send + std::fmt::Debug>() {}
        assert_send::<TcpTransport>();
        assert_send::<TcpConnector>();
    }

    /// Accept one connection on a loopback port and run `handler` on it.
    async fn start_mock_server<F, Fut>(handler: F) -> u16
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handler(stream).await;
        });
        port
    }

    #[tokio::test]
    async fn connect_fails_when_nothing_listens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = TcpTransport::connect("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, SnapperError::Io(_)));
    }

    #[tokio::test]
    async fn recv_decodes_split_frames() {
        let port = start_mock_server(|mut stream| async move {
            stream.write_all(b"$5\r\nhel").await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            stream.write_all(b"lo\r\n$-1\r\n$5\r\nworld\r\n").await.unwrap();
        })
        .await;

        let mut transport = TcpTransport::connect("127.0.0.1", port).await.unwrap();
        let first = transport.recv().await.unwrap().unwrap();
        assert_eq!(first, Frame::Payload(Bytes::from_static(b"hello")));
        let second = transport.recv().await.unwrap().unwrap();
        assert_eq!(second, Frame::Payload(Bytes::from_static(b"world")));
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn desync_surfaces_as_codec_error() {
        let port = start_mock_server(|mut stream| async move {
            stream.write_all(b"$3\r\nabcXY").await.unwrap();
        })
        .await;

        let mut transport = TcpTransport::connect("127.0.0.1", port).await.unwrap();
        let err = transport.recv().await.unwrap().unwrap_err();
        assert!(matches!(err, SnapperError::Codec(_)));
    }

    #[test]
    fn read_failures_are_receive_errors() {
        let io = CodecError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        match receive_error(io) {
            SnapperError::TransportReceive(msg) => assert!(msg.contains("reset by peer")),
            other => panic!("expected TransportReceive, got {other:?}"),
        }
        assert!(matches!(
            receive_error(CodecError::Desync("bad".into())),
            SnapperError::Codec(CodecError::Desync(_))
        ));
    }

    #[tokio::test]
    async fn send_writes_frames_verbatim() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let port = start_mock_server(|mut stream| async move {
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            tx.send(buf).unwrap();
        })
        .await;

        let mut transport = TcpTransport::connect("127.0.0.1", port).await.unwrap();
        transport.send(codec::frame(b"ping")).await.unwrap();
        transport.close().await.unwrap();

        assert_eq!(rx.await.unwrap(), b"$4\r\nping\r\n");
    }

    #[tokio::test]
    async fn send_after_close_returns_transport_closed() {
        let port = start_mock_server(|mut stream| async move {
            let mut buf = Vec::new();
            let _ = stream.read_to_end(&mut buf).await;
        })
        .await;

        let mut transport = TcpTransport::connect("127.0.0.1", port).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let err = transport.send(codec::frame(b"x")).await.unwrap_err();
        assert!(matches!(err, SnapperError::TransportClosed));
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn connector_opens_fresh_transports() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            for _ in 0..2 {
                let (mut stream, _) = listener.accept().await.unwrap();
                stream.write_all(b"$2\r\nhi\r\n").await.unwrap();
            }
        });

        let connector = TcpConnector::new("127.0.0.1", port)
            .with_connect_timeout(Duration::from_secs(5));
        for _ in 0..2 {
            let mut transport = connector.connect().await.unwrap();
            let frame = transport.recv().await.unwrap().unwrap();
            assert_eq!(frame, Frame::Payload(Bytes::from_static(b"hi")));
        }
        accept.await.unwrap();
    }
}
