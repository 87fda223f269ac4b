#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Wire format tests for the Snapper producer.
//!
//! Checks outbound requests byte for byte, classifies JSON fixtures shaped
//! like real server output, and runs the frame decoder over streams split at
//! awkward boundaries.

use bytes::BytesMut;
use serde_json::{json, Value};
use snapper_producer::codec::{self, CodecError, Frame, FrameDecoder};
use snapper_producer::error_codes::ErrorCode;
use snapper_producer::protocol::{
    encode_request, parse_message, Incoming, RpcErrorObject, METHOD_AUTH, METHOD_PUBLISH,
    METHOD_SUBSCRIBE, METHOD_UNSUBSCRIBE,
};
use snapper_producer::SnapperError;
use tokio_util::codec::Decoder;

// ════════════════════════════════════════════════════════════════════
// Helper
// ════════════════════════════════════════════════════════════════════

/// Feed `chunks` to one decoder in order and collect every frame.
fn decode_chunks(chunks: &[&[u8]]) -> Vec<Frame> {
    let mut decoder = FrameDecoder::new();
    let mut buf = BytesMut::new();
    let mut frames = Vec::new();
    for chunk in chunks {
        buf.extend_from_slice(chunk);
        while let Some(frame) = decoder.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
    }
    assert!(buf.is_empty(), "leftover bytes: {buf:?}");
    frames
}

fn payload_json(frame: &Frame) -> Value {
    match frame {
        Frame::Payload(bytes) => serde_json::from_slice(bytes).unwrap(),
        other => panic!("expected payload, got {other:?}"),
    }
}

// ════════════════════════════════════════════════════════════════════
// Outbound requests
// ════════════════════════════════════════════════════════════════════

#[test]
fn auth_request_wire_bytes() {
    let bytes = encode_request(1, METHOD_AUTH, &[json!("tok.en.sig")]).unwrap();
    let body = r#"{"jsonrpc":"2.0","id":1,"method":"auth","params":["tok.en.sig"]}"#;
    let expected = format!("${}\r\n{body}\r\n", body.len());
    assert_eq!(&bytes[..], expected.as_bytes());
}

#[test]
fn publish_request_carries_room_message_pairs() {
    let batch = vec![json!(["news", {"headline": "hi"}]), json!(["sport", 3])];
    let bytes = encode_request(7, METHOD_PUBLISH, &batch).unwrap();

    let frames = decode_chunks(&[&bytes]);
    assert_eq!(frames.len(), 1);
    assert_eq!(
        payload_json(&frames[0]),
        json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "publish",
            "params": [["news", {"headline": "hi"}], ["sport", 3]]
        })
    );
}

#[test]
fn room_requests_use_reserved_method_names() {
    for (method, id) in [(METHOD_SUBSCRIBE, 2), (METHOD_UNSUBSCRIBE, 3)] {
        let bytes = encode_request(id, method, &[json!("lobby"), json!("c-1")]).unwrap();
        let value = payload_json(&decode_chunks(&[&bytes])[0]);
        assert_eq!(value["method"], method);
        assert_eq!(value["params"], json!(["lobby", "c-1"]));
    }
    assert_eq!(METHOD_SUBSCRIBE, "subscribe");
    assert_eq!(METHOD_UNSUBSCRIBE, "unsubscribe");
}

#[test]
fn multibyte_payload_length_counts_bytes() {
    let bytes = encode_request(4, METHOD_PUBLISH, &[json!(["ümlaut", "日本"])]).unwrap();
    let header_end = bytes.iter().position(|&b| b == b'\r').unwrap();
    let declared: usize = std::str::from_utf8(&bytes[1..header_end])
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(declared, bytes.len() - header_end - 4);
}

// ════════════════════════════════════════════════════════════════════
// Inbound classification
// ════════════════════════════════════════════════════════════════════

#[test]
fn auth_success_fixture() {
    let msg = parse_message(br#"{"jsonrpc":"2.0","id":1,"result":{"id":"sess-9f2"}}"#).unwrap();
    assert_eq!(msg.command_id(), Some(1));
    match msg {
        Incoming::Success { result, .. } => assert_eq!(result["id"], "sess-9f2"),
        other => panic!("expected Success, got {other:?}"),
    }
}

#[test]
fn null_result_is_still_a_success() {
    let msg = parse_message(br#"{"jsonrpc":"2.0","id":12,"result":null}"#).unwrap();
    assert_eq!(
        msg,
        Incoming::Success {
            id: json!(12),
            result: Value::Null
        }
    );
}

#[test]
fn error_fixture_with_data() {
    let msg = parse_message(
        br#"{"jsonrpc":"2.0","id":3,"error":{"code":-32602,"message":"Invalid params","data":{"field":"room"}}}"#,
    )
    .unwrap();
    let Incoming::Failure { id, error } = msg else {
        panic!("expected Failure");
    };
    assert_eq!(id, json!(3));
    assert_eq!(error.data, Some(json!({"field": "room"})));

    let err = SnapperError::from(error);
    assert_eq!(err.error_code(), Some(ErrorCode::InvalidParams));
    assert_eq!(err.to_string(), "rpc error -32602: Invalid params");
}

#[test]
fn session_invalid_fixture() {
    let msg =
        parse_message(br#"{"jsonrpc":"2.0","id":5,"error":{"code":400,"message":"session expired"}}"#)
            .unwrap();
    match msg {
        Incoming::Failure {
            error: RpcErrorObject { code, .. },
            ..
        } => assert_eq!(ErrorCode::from_code(code), Some(ErrorCode::SessionInvalid)),
        other => panic!("expected Failure, got {other:?}"),
    }
}

#[test]
fn error_without_id_has_no_command() {
    let msg =
        parse_message(br#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#)
            .unwrap();
    assert_eq!(msg.command_id(), None);
}

#[test]
fn server_notification_is_a_call() {
    let msg = parse_message(br#"{"jsonrpc":"2.0","method":"kick","params":["c-1"]}"#).unwrap();
    assert_eq!(
        msg,
        Incoming::Call {
            method: "kick".into(),
            id: None
        }
    );
    assert_eq!(msg.command_id(), None);
}

#[test]
fn malformed_payloads_are_parse_errors() {
    let cases: [&[u8]; 5] = [
        b"not json",
        b"[1,2,3]",
        br#"{"id":1,"result":true}"#,
        br#"{"jsonrpc":"1.0","id":1,"result":true}"#,
        br#"{"jsonrpc":"2.0","id":1}"#,
    ];
    for case in cases {
        assert!(
            matches!(parse_message(case), Err(SnapperError::Parse(_))),
            "{}",
            String::from_utf8_lossy(case)
        );
    }
}

// ════════════════════════════════════════════════════════════════════
// Frame decoding over split streams
// ════════════════════════════════════════════════════════════════════

#[test]
fn frames_split_at_every_boundary() {
    let mut stream = Vec::new();
    stream.extend_from_slice(&codec::frame(br#"{"jsonrpc":"2.0","id":1,"result":true}"#));
    stream.extend_from_slice(b"$-1\r\n");
    stream.extend_from_slice(b"-ERR busy\r\n");
    stream.extend_from_slice(&codec::frame(b"{}"));

    for split in 0..=stream.len() {
        let (head, tail) = stream.split_at(split);
        let frames = decode_chunks(&[head, tail]);
        assert_eq!(frames.len(), 3, "split at {split}");
        assert_eq!(payload_json(&frames[0])["result"], true);
        assert_eq!(frames[1], Frame::Error("ERR busy".into()));
        assert_eq!(payload_json(&frames[2]), json!({}));
    }
}

#[test]
fn byte_at_a_time_delivery() {
    let bytes = encode_request(9, METHOD_SUBSCRIBE, &[json!("r"), json!("c")]).unwrap();
    let chunks: Vec<&[u8]> = bytes.chunks(1).collect();
    let frames = decode_chunks(&chunks);
    assert_eq!(frames.len(), 1);
    assert_eq!(payload_json(&frames[0])["id"], 9);
}

#[test]
fn empty_payload_frame() {
    let frames = decode_chunks(&[b"$0\r\n\r\n"]);
    assert_eq!(frames, vec![Frame::Payload(bytes::Bytes::new())]);
}

#[test]
fn desync_cases() {
    let cases: [&[u8]; 4] = [
        b"+OK\r\n",
        b"$abc\r\n",
        b"$-5\r\n",
        b"$2\r\nokXY",
    ];
    for case in cases {
        let mut buf = BytesMut::from(case);
        let result = FrameDecoder::new().decode(&mut buf);
        assert!(
            matches!(result, Err(CodecError::Desync(_))),
            "{}: {result:?}",
            String::from_utf8_lossy(case)
        );
    }
}

#[test]
fn oversized_length_is_rejected_before_buffering() {
    let header = format!("${}\r\n", codec::MAX_FRAME_LEN + 1);
    let mut buf = BytesMut::from(header.as_bytes());
    assert!(matches!(
        FrameDecoder::new().decode(&mut buf),
        Err(CodecError::Desync(_))
    ));
}

// ════════════════════════════════════════════════════════════════════
// Error codes
// ════════════════════════════════════════════════════════════════════

#[test]
fn error_codes_round_trip_through_numbers() {
    for code in [-32700, -32600, -32601, -32602, -32603, -32000, 400] {
        let known = ErrorCode::from_code(code).unwrap();
        assert_eq!(known.code(), code);
        assert!(!known.description().is_empty());
    }
    assert_eq!(ErrorCode::from_code(401), None);
    assert_eq!(ErrorCode::from_code(0), None);
}
