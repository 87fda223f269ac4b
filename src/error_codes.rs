//! Error codes carried in JSON-RPC error objects returned by a Snapper server.
//!
//! The standard JSON-RPC 2.0 codes are mapped one-to-one. Snapper adds
//! `400`, which the server returns when a previously valid session is no
//! longer recognised (typically after a server restart).

use std::fmt;

/// Structured error codes returned by a Snapper server.
///
/// Use [`from_code`](ErrorCode::from_code) to classify the numeric `code`
/// field of an error object and [`description()`](ErrorCode::description)
/// for a human-readable explanation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The server could not parse the JSON it received (`-32700`).
    ParseError,
    /// The JSON was not a valid request object (`-32600`).
    InvalidRequest,
    /// The requested method does not exist (`-32601`).
    MethodNotFound,
    /// The method parameters were rejected (`-32602`).
    InvalidParams,
    /// The server failed internally (`-32603`).
    InternalError,
    /// Implementation-defined server error (`-32099..=-32000`).
    ServerError,
    /// The session behind this connection is no longer valid (`400`).
    SessionInvalid,
}

impl ErrorCode {
    /// Classify a numeric error code, returning `None` for codes the client
    /// has no special knowledge of.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -32700 => Some(Self::ParseError),
            -32600 => Some(Self::InvalidRequest),
            -32601 => Some(Self::MethodNotFound),
            -32602 => Some(Self::InvalidParams),
            -32603 => Some(Self::InternalError),
            -32099..=-32000 => Some(Self::ServerError),
            400 => Some(Self::SessionInvalid),
            _ => None,
        }
    }

    /// The canonical numeric value of this code.
    ///
    /// [`ServerError`](Self::ServerError) covers a range; its canonical value
    /// is the first code of that range, `-32000`.
    pub fn code(&self) -> i64 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::ServerError => -32000,
            Self::SessionInvalid => 400,
        }
    }

    /// Returns a human-readable description of this error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::ParseError => "The server received invalid JSON and could not parse the request.",
            Self::InvalidRequest => "The request sent to the server is not a valid JSON-RPC object.",
            Self::MethodNotFound => "The server does not provide the requested method.",
            Self::InvalidParams => {
                "The server rejected the method parameters. Check room and consumer ids."
            }
            Self::InternalError => {
                "An internal server error occurred. Please try again or contact support if the issue persists."
            }
            Self::ServerError => "The server reported an implementation-defined error.",
            Self::SessionInvalid => {
                "The session is no longer valid. The client reconnects and authenticates again."
            }
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}
