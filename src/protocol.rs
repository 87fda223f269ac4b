//! JSON-RPC 2.0 envelopes exchanged with a Snapper server.
//!
//! Outbound traffic is always a request object; the server answers with a
//! success or error response carrying the same integer `id`. The reserved
//! method names are exported as constants.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec;
use crate::error::{Result, SnapperError};

/// JSON-RPC protocol version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// Authenticate the connection. Params: `[token]`.
pub const METHOD_AUTH: &str = "auth";
/// Publish a batch of messages. Params: `[[room, message], ...]`.
pub const METHOD_PUBLISH: &str = "publish";
/// Subscribe a consumer to a room. Params: `[room, consumerId]`.
pub const METHOD_SUBSCRIBE: &str = "subscribe";
/// Unsubscribe a consumer from a room. Params: `[room, consumerId]`.
pub const METHOD_UNSUBSCRIBE: &str = "unsubscribe";

/// An outbound JSON-RPC request.
#[derive(Debug, Serialize)]
pub struct RpcRequest<'a> {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Command id assigned by the registry.
    pub id: u64,
    /// Method name.
    pub method: &'a str,
    /// Positional parameters.
    pub params: &'a [Value],
}

impl<'a> RpcRequest<'a> {
    /// Build a request envelope.
    pub fn new(id: u64, method: &'a str, params: &'a [Value]) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

/// The `error` member of a JSON-RPC error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    /// Numeric error code.
    pub code: i64,
    /// Short description of the error.
    pub message: String,
    /// Optional additional information.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<RpcErrorObject> for SnapperError {
    fn from(err: RpcErrorObject) -> Self {
        SnapperError::Rpc {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// A success response.
    Success {
        /// Raw `id` member (normally an integer assigned by this client).
        id: Value,
        /// The `result` member; may be `null`.
        result: Value,
    },
    /// An error response. `id` is `null` when the server could not read the
    /// request id.
    Failure {
        /// Raw `id` member.
        id: Value,
        /// The `error` member.
        error: RpcErrorObject,
    },
    /// A request or notification sent by the server. Producers do not serve
    /// any methods, so these are reported as unhandled.
    Call {
        /// Method named by the server.
        method: String,
        /// The `id` member, absent for notifications.
        id: Option<Value>,
    },
}

impl Incoming {
    /// The command id this message answers, if it is a response with an
    /// integer id.
    pub fn command_id(&self) -> Option<u64> {
        match self {
            Self::Success { id, .. } | Self::Failure { id, .. } => id.as_u64(),
            Self::Call { .. } => None,
        }
    }
}

/// Serialize a request and wrap it in a wire frame.
pub fn encode_request(id: u64, method: &str, params: &[Value]) -> Result<Bytes> {
    let json = serde_json::to_vec(&RpcRequest::new(id, method, params))?;
    Ok(codec::frame(&json))
}

/// Parse and classify one inbound payload.
///
/// # Errors
///
/// Returns [`SnapperError::Parse`] when the payload is not JSON or is not a
/// JSON-RPC 2.0 object.
pub fn parse_message(payload: &[u8]) -> Result<Incoming> {
    let value: Value = serde_json::from_slice(payload).map_err(|e| {
        SnapperError::Parse(format!("{e}: {}", String::from_utf8_lossy(payload)))
    })?;
    let Value::Object(mut obj) = value else {
        return Err(SnapperError::Parse(format!(
            "expected a JSON object: {}",
            String::from_utf8_lossy(payload)
        )));
    };

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(SnapperError::Parse(format!(
            "missing or unsupported jsonrpc version: {}",
            String::from_utf8_lossy(payload)
        )));
    }

    if let Some(method) = obj.get("method").and_then(Value::as_str) {
        return Ok(Incoming::Call {
            method: method.to_string(),
            id: obj.remove("id"),
        });
    }

    let id = obj.remove("id").unwrap_or(Value::Null);
    if let Some(result) = obj.remove("result") {
        return Ok(Incoming::Success { id, result });
    }
    if let Some(error) = obj.remove("error") {
        let error: RpcErrorObject = serde_json::from_value(error).map_err(|e| {
            SnapperError::Parse(format!(
                "malformed error object ({e}): {}",
                String::from_utf8_lossy(payload)
            ))
        })?;
        return Ok(Incoming::Failure { id, error });
    }

    Err(SnapperError::Parse(format!(
        "neither result nor error present: {}",
        String::from_utf8_lossy(payload)
    )))
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_is_framed_json_rpc() {
        let frame = encode_request(3, METHOD_SUBSCRIBE, &[json!("lobby"), json!("c1")]).unwrap();
        let text = std::str::from_utf8(&frame).unwrap();
        let (header, rest) = text.split_once("\r\n").unwrap();
        let body = rest.strip_suffix("\r\n").unwrap();

        assert_eq!(header, format!("${}", body.len()));
        let value: Value = serde_json::from_str(body).unwrap();
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "id": 3, "method": "subscribe", "params": ["lobby", "c1"]})
        );
    }

    #[test]
    fn null_result_is_still_success() {
        let msg = parse_message(br#"{"jsonrpc":"2.0","id":9,"result":null}"#).unwrap();
        assert_eq!(
            msg,
            Incoming::Success {
                id: json!(9),
                result: Value::Null
            }
        );
        assert_eq!(msg.command_id(), Some(9));
    }

    #[test]
    fn error_response_with_null_id() {
        let msg = parse_message(
            br#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#,
        )
        .unwrap();
        let Incoming::Failure { id, error } = &msg else {
            panic!("expected failure, got {msg:?}");
        };
        assert!(id.is_null());
        assert_eq!(error.code, -32700);
        assert_eq!(msg.command_id(), None);
    }

    #[test]
    fn server_notifications_are_calls() {
        let msg = parse_message(br#"{"jsonrpc":"2.0","method":"ping","params":[]}"#).unwrap();
        assert_eq!(
            msg,
            Incoming::Call {
                method: "ping".into(),
                id: None
            }
        );
    }

    #[test]
    fn invalid_payloads_are_parse_errors() {
        let cases: [&[u8]; 5] = [
            b"not json",
            br#"[1,2,3]"#,
            br#"{"id":1,"result":true}"#,
            br#"{"jsonrpc":"2.0","id":1}"#,
            br#"{"jsonrpc":"2.0","id":1,"error":"boom"}"#,
        ];
        for raw in cases {
            let err = parse_message(raw).unwrap_err();
            assert!(matches!(err, SnapperError::Parse(_)), "{raw:?}");
        }
    }

    #[test]
    fn error_object_converts_to_rpc_error() {
        let err: SnapperError = RpcErrorObject {
            code: 400,
            message: "invalid session".into(),
            data: Some(json!({"retry": true})),
        }
        .into();
        assert!(matches!(err, SnapperError::Rpc { code: 400, .. }));
    }
}
