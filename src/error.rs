//! Error types for the Snapper producer client.

use thiserror::Error;

use crate::error_codes::ErrorCode;

/// Errors that can occur when using the Snapper client.
#[derive(Debug, Error)]
pub enum SnapperError {
    /// The client configuration was rejected before any I/O happened.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A caller-supplied argument (room, consumer id, method) was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Failed to send a frame through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a frame from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// The inbound byte stream could not be split into frames.
    #[error("codec error: {0}")]
    Codec(#[from] crate::codec::CodecError),

    /// Failed to serialize or deserialize a JSON value.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The server sent a RESP error line instead of a bulk frame.
    #[error("server error: {0}")]
    Server(String),

    /// A frame arrived intact but does not hold a JSON-RPC response.
    #[error("parse error: {0}")]
    Parse(String),

    /// The server sent a request or notification, which producers do not serve.
    #[error("unhandled message from server: {method}")]
    UnhandledMessage {
        /// Method named by the server-originated message.
        method: String,
    },

    /// The server answered a command with a JSON-RPC error object.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// Numeric error code from the server.
        code: i64,
        /// Human-readable error message from the server.
        message: String,
        /// Optional structured error payload.
        data: Option<serde_json::Value>,
    },

    /// A command received no response within the configured RPC timeout.
    #[error("rpc timed out: {id}, {method}")]
    Timeout {
        /// Id of the command that expired.
        id: u64,
        /// Method of the command that expired.
        method: String,
    },

    /// Reconnection was abandoned after too many attempts.
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted {
        /// Number of attempts made.
        attempts: u32,
    },

    /// The token signer could not produce an auth token.
    #[error("token signing error: {0}")]
    Signing(String),

    /// Messages queued with `send_message` were discarded because the client
    /// closed before they could be published.
    #[error("discarded {count} unsent messages on close")]
    MessagesDropped {
        /// Number of messages lost.
        count: usize,
    },

    /// The client has been closed; no further operations are possible.
    #[error("client has been closed")]
    Closed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SnapperError {
    /// Returns the structured [`ErrorCode`] of an [`Rpc`](Self::Rpc) error,
    /// if the code is one the client knows.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Rpc { code, .. } => ErrorCode::from_code(*code),
            _ => None,
        }
    }

    /// Returns `true` for errors that end the client permanently.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::ReconnectExhausted { .. })
    }
}

/// A specialized [`Result`] type for Snapper client operations.
pub type Result<T> = std::result::Result<T, SnapperError>;
