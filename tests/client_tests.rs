#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! End-to-end client tests for the Snapper producer.
//!
//! Each test runs a real [`SnapperClient`] against the loopback
//! [`MockServer`](common::MockServer) from `tests/common`, scripting the
//! server side frame by frame.

mod common;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;
use snapper_producer::{
    BackoffPolicy, ConnectionState, ErrorCode, SnapperClient, SnapperError, SnapperEvent,
};
use tokio_test::{assert_err, assert_ok};

use common::{config, decode_token, expect_connected, init_tracing, next_event, MockServer};

// ════════════════════════════════════════════════════════════════════
// Handshake
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn auth_token_identifies_the_producer() {
    init_tracing();
    let server = MockServer::bind().await;
    let (client, mut events) = SnapperClient::connect(
        config(server.port).with_expires_in(Duration::from_secs(3600)),
    )
    .unwrap();

    let mut conn = server.accept().await;
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
    let auth = conn.accept_auth("session-42").await;
    assert_eq!(auth["jsonrpc"], "2.0");

    let (header, claims) = decode_token(auth["params"][0].as_str().unwrap());
    assert_eq!(header.typ.as_deref(), Some("JWT"));
    assert_eq!(claims["producerId"], "producer-1");
    let exp = claims["exp"].as_u64().unwrap();
    assert!((now + 3599..=now + 3601).contains(&exp), "exp = {exp}");

    assert_eq!(expect_connected(&mut events).await.as_deref(), Some("session-42"));
    assert_eq!(client.state(), ConnectionState::Authenticated);
    assert_eq!(client.session_id().await.as_deref(), Some("session-42"));

    client.close().await;
    assert!(conn.closed_by_client().await);
}

#[tokio::test]
async fn join_room_round_trip() {
    init_tracing();
    let server = MockServer::bind().await;
    let (client, mut events) = SnapperClient::connect(config(server.port)).unwrap();

    let server_side = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.accept_auth("s").await;
        let join = conn.next_request().await;
        assert_eq!(join["method"], "subscribe");
        assert_eq!(join["params"], json!(["lobby", "consumer-1"]));
        conn.reply(&join["id"], json!({"joined": "lobby"})).await;

        let leave = conn.next_request().await;
        assert_eq!(leave["method"], "unsubscribe");
        assert_eq!(leave["params"], json!(["lobby", "consumer-1"]));
        conn.reply(&leave["id"], json!(null)).await;
        conn
    });

    let joined = client.join_room("lobby", "consumer-1").await.unwrap();
    assert_eq!(joined, json!({"joined": "lobby"}));
    let left = client.leave_room("lobby", "consumer-1").await.unwrap();
    assert!(left.is_null());

    expect_connected(&mut events).await;
    let _conn = server_side.await.unwrap();
    client.close().await;
}

#[tokio::test]
async fn rejected_auth_closes_the_client() {
    init_tracing();
    let server = MockServer::bind().await;
    let (client, mut events) = SnapperClient::connect(config(server.port)).unwrap();

    let mut conn = server.accept().await;
    let auth = conn.next_request().await;
    conn.reply_error(&auth["id"], -32001, "invalid signature").await;

    match next_event(&mut events).await {
        SnapperEvent::Error(err) => {
            assert_eq!(err.error_code(), Some(ErrorCode::ServerError));
            assert!(err.to_string().contains("invalid signature"));
        }
        other => panic!("expected Error, got {other:?}"),
    }
    assert!(matches!(next_event(&mut events).await, SnapperEvent::Closed));
    assert!(client.is_closed());
    assert!(matches!(
        client.join_room("lobby", "c").await,
        Err(SnapperError::Closed)
    ));
}

// ════════════════════════════════════════════════════════════════════
// Publishing
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn messages_sent_before_auth_are_published_after_it() {
    init_tracing();
    let server = MockServer::bind().await;
    let (client, mut events) = SnapperClient::connect(config(server.port)).unwrap();

    assert_ok!(client.send_message("news", "first"));
    assert_ok!(client.send_message("news", json!({"n": 2})));

    let mut conn = server.accept().await;
    conn.accept_auth("s").await;
    expect_connected(&mut events).await;

    let publish = conn.next_request().await;
    assert_eq!(publish["method"], "publish");
    assert_eq!(publish["params"], json!([["news", "first"], ["news", {"n": 2}]]));

    conn.reply(&publish["id"], json!("ok")).await;
    match next_event(&mut events).await {
        SnapperEvent::Jsonrpc { id, result } => {
            assert_eq!(json!(id), publish["id"]);
            assert_eq!(result, "ok");
        }
        other => panic!("expected Jsonrpc, got {other:?}"),
    }

    client.close().await;
}

#[tokio::test]
async fn in_flight_publishes_stop_at_the_high_water_mark() {
    init_tracing();
    let server = MockServer::bind().await;
    let (client, mut events) = SnapperClient::connect(
        config(server.port)
            .with_batch_size(1)
            .with_rpc_high_water(3),
    )
    .unwrap();

    let mut conn = server.accept().await;
    conn.accept_auth("s").await;
    expect_connected(&mut events).await;

    for i in 0..10 {
        client.send_message("room", i).unwrap();
    }
    let mut outstanding = Vec::new();
    for i in 0..3 {
        let publish = conn.next_request().await;
        assert_eq!(publish["params"], json!([["room", i]]));
        outstanding.push(publish["id"].clone());
    }
    assert!(conn.is_quiet_for(Duration::from_millis(200)).await);

    // Each acknowledgement lets exactly one more batch out.
    for i in 3..10 {
        let acked = outstanding.remove(0);
        conn.reply(&acked, json!(true)).await;
        let publish = conn.next_request().await;
        assert_eq!(publish["params"], json!([["room", i]]));
        outstanding.push(publish["id"].clone());
    }
    assert!(conn.is_quiet_for(Duration::from_millis(100)).await);

    client.close().await;
}

#[tokio::test]
async fn detached_requests_report_through_events() {
    init_tracing();
    let server = MockServer::bind().await;
    let (client, mut events) = SnapperClient::connect(config(server.port)).unwrap();

    let mut conn = server.accept().await;
    conn.accept_auth("s").await;
    expect_connected(&mut events).await;

    client
        .request_detached("stats", vec![json!("rooms")])
        .unwrap();
    let stats = conn.next_request().await;
    assert_eq!(stats["method"], "stats");
    conn.reply_error(&stats["id"], -32601, "Method not found").await;

    match next_event(&mut events).await {
        SnapperEvent::Error(err) => {
            assert_eq!(err.error_code(), Some(ErrorCode::MethodNotFound));
        }
        other => panic!("expected Error, got {other:?}"),
    }

    client.close().await;
}

// ════════════════════════════════════════════════════════════════════
// Inbound edge cases
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn null_frames_error_lines_and_strays_keep_the_link() {
    init_tracing();
    let server = MockServer::bind().await;
    let (client, mut events) = SnapperClient::connect(config(server.port)).unwrap();

    let mut conn = server.accept().await;
    conn.accept_auth("s").await;
    expect_connected(&mut events).await;

    conn.write_raw(b"$-1\r\n-ERR slow down\r\n").await;
    conn.reply(&json!(999), json!("nobody asked")).await;

    match next_event(&mut events).await {
        SnapperEvent::Error(SnapperError::Server(line)) => assert_eq!(line, "ERR slow down"),
        other => panic!("expected server error, got {other:?}"),
    }
    match next_event(&mut events).await {
        SnapperEvent::Warn(stray) => assert_eq!(stray.command_id(), Some(999)),
        other => panic!("expected Warn, got {other:?}"),
    }

    // The link is still usable.
    let (answer, ()) = tokio::join!(client.request("echo", vec![json!(1)]), async {
        let echo = conn.next_request().await;
        conn.reply(&echo["id"], json!(1)).await;
    });
    assert_eq!(answer.unwrap(), json!(1));
    assert_eq!(client.state(), ConnectionState::Authenticated);

    client.close().await;
}

#[tokio::test]
async fn desynced_stream_forces_a_reconnect() {
    init_tracing();
    let server = MockServer::bind().await;
    let (client, mut events) = SnapperClient::connect(config(server.port)).unwrap();

    let mut conn = server.accept().await;
    conn.accept_auth("first").await;
    expect_connected(&mut events).await;

    conn.write_raw(b"$3\r\nabcXY").await;
    assert!(matches!(
        next_event(&mut events).await,
        SnapperEvent::Error(SnapperError::Codec(_))
    ));
    assert!(matches!(
        next_event(&mut events).await,
        SnapperEvent::Reconnecting { attempts: 1, .. }
    ));

    let mut second = server.accept().await;
    second.accept_auth("second").await;
    assert_eq!(expect_connected(&mut events).await.as_deref(), Some("second"));

    client.close().await;
}

// ════════════════════════════════════════════════════════════════════
// Reconnect and replay
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn reconnect_replays_pending_and_queued_work() {
    init_tracing();
    let server = MockServer::bind().await;
    let (client, mut events) = SnapperClient::connect(config(server.port)).unwrap();

    let mut first = server.accept().await;
    first.accept_auth("first").await;
    expect_connected(&mut events).await;

    let join = client.join_room("lobby", "consumer-1");
    let server_side = async {
        let pending = first.next_request().await;
        assert_eq!(pending["method"], "subscribe");

        // Server restarts without answering.
        drop(first);
        assert!(matches!(next_event(&mut events).await, SnapperEvent::End));
        match next_event(&mut events).await {
            SnapperEvent::Reconnecting { delay, attempts } => {
                assert_eq!(attempts, 1);
                assert_eq!(delay, Duration::from_millis(20));
            }
            other => panic!("expected Reconnecting, got {other:?}"),
        }

        // Queued while the link is down.
        client.send_message("news", "during the gap").unwrap();

        let mut second = server.accept().await;
        second.accept_auth("second").await;
        assert_eq!(expect_connected(&mut events).await.as_deref(), Some("second"));

        let replayed = second.next_request().await;
        assert_eq!(replayed, pending);
        let publish = second.next_request().await;
        assert_eq!(publish["method"], "publish");
        assert_eq!(publish["params"], json!([["news", "during the gap"]]));

        second.reply(&replayed["id"], json!("subscribed")).await;
        second
    };

    let (joined, _second) = tokio::join!(join, server_side);
    assert_eq!(joined.unwrap(), json!("subscribed"));

    client.close().await;
}

#[tokio::test]
async fn session_invalidation_reconnects_instead_of_failing() {
    init_tracing();
    let server = MockServer::bind().await;
    let (client, mut events) = SnapperClient::connect(config(server.port)).unwrap();

    let mut first = server.accept().await;
    first.accept_auth("old").await;
    expect_connected(&mut events).await;

    let request = client.request("subscribe", vec![json!("lobby"), json!("c")]);
    let server_side = async {
        let sent = first.next_request().await;
        first.reply_error(&sent["id"], 400, "session expired").await;
        assert!(first.closed_by_client().await);

        let mut second = server.accept().await;
        second.accept_auth("new").await;
        let replayed = second.next_request().await;
        assert_eq!(replayed["id"], sent["id"]);
        second.reply(&replayed["id"], json!("ok")).await;
        second
    };

    let (answer, _second) = tokio::join!(request, server_side);
    assert_eq!(answer.unwrap(), json!("ok"));
    assert_eq!(client.session_id().await.as_deref(), Some("new"));

    client.close().await;
}

#[tokio::test]
async fn exhausted_reconnects_close_the_client() {
    init_tracing();
    // Reserve a port nobody listens on.
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let (client, mut events) = SnapperClient::connect(config(port).with_backoff(BackoffPolicy {
        initial_delay: Duration::from_millis(10),
        growth_factor: 2.0,
        max_delay: Duration::from_millis(50),
        max_attempts: 3,
    }))
    .unwrap();

    let mut attempts = Vec::new();
    loop {
        match next_event(&mut events).await {
            SnapperEvent::Error(SnapperError::Io(_)) => {}
            SnapperEvent::Reconnecting { attempts: n, .. } => attempts.push(n),
            SnapperEvent::Error(SnapperError::ReconnectExhausted { attempts }) => {
                assert_eq!(attempts, 3);
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(attempts, vec![1, 2, 3]);
    assert!(matches!(next_event(&mut events).await, SnapperEvent::Closed));
    assert!(client.is_closed());
    assert_err!(client.send_message("news", "too late"));
}

// ════════════════════════════════════════════════════════════════════
// Timeouts and close
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn unanswered_request_times_out_without_dropping_the_link() {
    init_tracing();
    let server = MockServer::bind().await;
    let (client, mut events) = SnapperClient::connect(
        config(server.port).with_rpc_timeout(Duration::from_millis(200)),
    )
    .unwrap();

    let mut conn = server.accept().await;
    conn.accept_auth("s").await;
    expect_connected(&mut events).await;

    let (answer, sent) = tokio::join!(
        client.request("subscribe", vec![json!("slow"), json!("c")]),
        conn.next_request()
    );
    match answer {
        Err(SnapperError::Timeout { id, method }) => {
            assert_eq!(json!(id), sent["id"]);
            assert_eq!(method, "subscribe");
            assert_eq!(
                SnapperError::Timeout { id, method }.to_string(),
                format!("rpc timed out: {id}, subscribe")
            );
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert_eq!(client.state(), ConnectionState::Authenticated);

    client.close().await;
}

#[tokio::test]
async fn close_fails_all_pending_requests() {
    init_tracing();
    let server = MockServer::bind().await;
    let (client, mut events) = SnapperClient::connect(config(server.port)).unwrap();

    let mut conn = server.accept().await;
    conn.accept_auth("s").await;
    expect_connected(&mut events).await;

    let closer = async {
        for _ in 0..3 {
            conn.next_request().await;
        }
        client.close().await;
    };
    let (a, b, c, ()) = tokio::join!(
        client.join_room("r1", "c"),
        client.join_room("r2", "c"),
        client.request("custom", vec![]),
        closer
    );
    for result in [a, b, c] {
        assert!(matches!(result, Err(SnapperError::Closed)), "{result:?}");
    }

    // Fails immediately, without touching the socket.
    assert!(matches!(
        client.request("custom", vec![]).await,
        Err(SnapperError::Closed)
    ));
    assert!(conn.closed_by_client().await);

    let mut last = None;
    while let Some(event) = events.recv().await {
        last = Some(event);
    }
    assert!(matches!(last, Some(SnapperEvent::Closed)));

    // Idempotent.
    client.close().await;
}

#[tokio::test]
async fn invalid_config_is_rejected_before_connecting() {
    let result = SnapperClient::connect(snapper_producer::ClientConfig::new(
        0,
        "producer-1",
        vec!["secret".into()],
    ));
    assert!(matches!(result, Err(SnapperError::InvalidConfig(_))));

    let result =
        SnapperClient::connect(snapper_producer::ClientConfig::new(7701, "producer-1", vec![]));
    assert!(matches!(result, Err(SnapperError::InvalidConfig(_))));
}
