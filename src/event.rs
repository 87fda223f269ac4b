//! Notifications surfaced to the host application.
//!
//! The connection task reports everything that is not the answer to a
//! specific awaited request through a bounded channel of [`SnapperEvent`]s,
//! returned from [`SnapperClient::start`](crate::SnapperClient::start).

use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::SnapperError;
use crate::protocol::Incoming;

/// Events emitted by a running client.
#[derive(Debug)]
pub enum SnapperEvent {
    /// The connection is authenticated and traffic is flowing.
    Connected {
        /// Session id returned by the server in the `auth` result, if any.
        session_id: Option<String>,
    },
    /// A reconnection attempt is starting after a backoff delay.
    Reconnecting {
        /// Delay waited before this attempt.
        delay: Duration,
        /// 1-based attempt number since the last successful connect.
        attempts: u32,
    },
    /// The client has closed for good. Always the last event.
    Closed,
    /// The server closed the connection cleanly. A reconnect follows.
    End,
    /// A transport, protocol or detached-command failure.
    Error(SnapperError),
    /// A response arrived that matches no live command.
    Warn(Incoming),
    /// A successful response to a detached command.
    Jsonrpc {
        /// Id of the completed command.
        id: u64,
        /// The `result` member of the response.
        result: Value,
    },
}

/// Sending half of the event channel, shared by the connection task and the
/// registry.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::Sender<SnapperEvent>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::Sender<SnapperEvent>) -> Self {
        Self { tx }
    }

    /// Emit an event. If the channel is full, log a warning and drop the
    /// event so the connection task never blocks on a slow consumer.
    pub(crate) fn emit(&self, event: SnapperEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!("event channel full, dropping event: {dropped:?}");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("event channel closed, receiver dropped");
            }
        }
    }

    /// Emit the final [`Closed`](SnapperEvent::Closed) event.
    ///
    /// Waits for channel capacity instead of dropping, because `Closed` is
    /// the last event and must never be lost.
    pub(crate) async fn emit_closed(&self) {
        if self.tx.send(SnapperEvent::Closed).await.is_err() {
            debug!("event channel closed, receiver dropped");
        }
    }
}
