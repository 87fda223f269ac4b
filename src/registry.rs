//! In-flight command table.
//!
//! Every RPC the client issues lives here from creation until it completes
//! exactly once: by a matched response, a timeout, or a forced close. Ids come
//! from a counter owned by the registry, so they are unique and strictly
//! increasing for the lifetime of one client and never reused across
//! reconnects. The table is ordered by id, which makes replay after a
//! reconnect follow the original submission order.

use std::collections::BTreeMap;
use std::future::poll_fn;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::debug;

use crate::error::{Result, SnapperError};
use crate::event::{EventSink, SnapperEvent};
use crate::protocol::{self, Incoming};

/// Where the outcome of a command goes.
#[derive(Debug)]
pub(crate) enum Reply {
    /// A caller is awaiting the outcome.
    Caller(oneshot::Sender<Result<Value>>),
    /// Nobody awaits it: failures become [`SnapperEvent::Error`], successes
    /// become [`SnapperEvent::Jsonrpc`].
    Detached,
    /// The connection task consumes the outcome itself (used for `auth`).
    Internal,
}

#[derive(Debug)]
struct RpcCommand {
    method: String,
    frame: Bytes,
    /// Written on the current link and awaiting a response.
    sent: bool,
    created_at: Instant,
    timer: delay_queue::Key,
    reply: Reply,
}

#[derive(Debug)]
pub(crate) struct RpcRegistry {
    commands: BTreeMap<u64, RpcCommand>,
    timers: DelayQueue<u64>,
    next_id: u64,
    timeout: Duration,
    events: EventSink,
}

impl RpcRegistry {
    /// `events` is the default handler for detached commands.
    pub(crate) fn new(timeout: Duration, events: EventSink) -> Self {
        Self {
            commands: BTreeMap::new(),
            timers: DelayQueue::new(),
            next_id: 0,
            timeout,
            events,
        }
    }

    /// Allocate an id, encode the frame and start the timeout.
    ///
    /// Nothing is written; the connection task decides when to send. If the
    /// request cannot be encoded the failure goes straight to `reply` and
    /// `None` is returned.
    pub(crate) fn create(&mut self, method: &str, params: &[Value], reply: Reply) -> Option<u64> {
        self.next_id += 1;
        let id = self.next_id;

        let frame = match protocol::encode_request(id, method, params) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = self.deliver(id, reply, Err(e));
                return None;
            }
        };

        let timer = self.timers.insert(id, self.timeout);
        self.commands.insert(
            id,
            RpcCommand {
                method: method.to_string(),
                frame,
                sent: false,
                created_at: Instant::now(),
                timer,
                reply,
            },
        );
        debug!(id, method, "rpc command created");
        Some(id)
    }

    /// Complete a live command with `outcome`.
    ///
    /// Returns the outcome back only for [`Reply::Internal`] commands.
    pub(crate) fn complete(&mut self, id: u64, outcome: Result<Value>) -> Option<Result<Value>> {
        let Some(command) = self.commands.remove(&id) else {
            debug!(id, "completion for unknown rpc command ignored");
            return None;
        };
        self.timers.remove(&command.timer);
        self.deliver(id, command.reply, outcome)
    }

    /// Route a server response to its command.
    ///
    /// An unknown id is reported as [`SnapperEvent::Warn`]. Returns the id and
    /// outcome for [`Reply::Internal`] commands.
    pub(crate) fn respond(&mut self, response: Incoming) -> Option<(u64, Result<Value>)> {
        let Some(id) = response.command_id().filter(|id| self.commands.contains_key(id)) else {
            self.events.emit(SnapperEvent::Warn(response));
            return None;
        };
        let outcome = match response {
            Incoming::Success { result, .. } => Ok(result),
            Incoming::Failure { error, .. } => Err(error.into()),
            Incoming::Call { method, .. } => Err(SnapperError::UnhandledMessage { method }),
        };
        self.complete(id, outcome).map(|outcome| (id, outcome))
    }

    /// Wait for the next command timeout and return its id.
    ///
    /// Resolves to `None` immediately when no timers are running.
    pub(crate) async fn next_expired(&mut self) -> Option<u64> {
        if self.timers.is_empty() {
            return None;
        }
        poll_fn(|cx| self.timers.poll_expired(cx))
            .await
            .map(|expired| expired.into_inner())
    }

    /// Complete a command whose timer has fired with a timeout error.
    pub(crate) fn expire(&mut self, id: u64) -> Option<Result<Value>> {
        // The timer entry was consumed by `next_expired`.
        let command = self.commands.remove(&id)?;
        debug!(
            id,
            method = %command.method,
            elapsed_ms = command.created_at.elapsed().as_millis() as u64,
            "rpc command timed out"
        );
        let error = SnapperError::Timeout {
            id,
            method: command.method.clone(),
        };
        self.deliver(id, command.reply, Err(error))
    }

    /// Complete every live command with the error produced by `error`.
    pub(crate) fn fail_all(&mut self, error: impl Fn() -> SnapperError) {
        let commands = std::mem::take(&mut self.commands);
        self.timers.clear();
        for (id, command) in commands {
            let _ = self.deliver(id, command.reply, Err(error()));
        }
    }

    /// Remove a command without delivering anything.
    pub(crate) fn discard(&mut self, id: u64) -> bool {
        match self.commands.remove(&id) {
            Some(command) => {
                self.timers.remove(&command.timer);
                true
            }
            None => false,
        }
    }

    /// Ids of commands not yet written on the current link, ascending.
    pub(crate) fn unsent_ids(&self) -> Vec<u64> {
        self.commands
            .iter()
            .filter(|(_, command)| !command.sent)
            .map(|(id, _)| *id)
            .collect()
    }

    pub(crate) fn frame(&self, id: u64) -> Option<Bytes> {
        self.commands.get(&id).map(|command| command.frame.clone())
    }

    pub(crate) fn mark_sent(&mut self, id: u64) {
        if let Some(command) = self.commands.get_mut(&id) {
            command.sent = true;
        }
    }

    /// Forget which commands were written; the link they went out on is gone.
    pub(crate) fn mark_all_unsent(&mut self) {
        for command in self.commands.values_mut() {
            command.sent = false;
        }
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.commands.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.commands.len()
    }

    fn deliver(&self, id: u64, reply: Reply, outcome: Result<Value>) -> Option<Result<Value>> {
        match reply {
            Reply::Caller(tx) => {
                if tx.send(outcome).is_err() {
                    debug!(id, "rpc caller dropped before completion");
                }
                None
            }
            Reply::Detached => {
                match outcome {
                    Ok(result) => self.events.emit(SnapperEvent::Jsonrpc { id, result }),
                    Err(error) => self.events.emit(SnapperEvent::Error(error)),
                }
                None
            }
            Reply::Internal => Some(outcome),
        }
    }
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
    use crate::protocol::RpcErrorObject;
    use serde_json::json;
    use tokio::sync::mpsc;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn registry() -> (RpcRegistry, mpsc::Receiver<SnapperEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (RpcRegistry::new(TIMEOUT, EventSink::new(tx)), rx)
    }

    fn caller() -> (Reply, oneshot::Receiver<Result<Value>>) {
        let (tx, rx) = oneshot::channel();
        (Reply::Caller(tx), rx)
    }

    #[tokio::test]
    async fn ids_are_distinct_and_strictly_increasing() {
        let (mut registry, _events) = registry();
        let ids: Vec<u64> = (0..50)
            .map(|_| registry.create("publish", &[], Reply::Detached).unwrap())
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(ids[0], 1);
        assert_eq!(registry.len(), 50);
    }

    #[tokio::test]
    async fn ids_are_not_reused_after_completion() {
        let (mut registry, _events) = registry();
        let first = registry.create("subscribe", &[], Reply::Detached).unwrap();
        registry.complete(first, Ok(Value::Null));
        let second = registry.create("subscribe", &[], Reply::Detached).unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn frame_is_encoded_at_creation() {
        let (mut registry, _events) = registry();
        let params = [json!("lobby"), json!("c1")];
        let id = registry.create("subscribe", &params, Reply::Detached).unwrap();
        assert_eq!(
            registry.frame(id).unwrap(),
            protocol::encode_request(id, "subscribe", &params).unwrap()
        );
    }

    #[tokio::test]
    async fn caller_receives_exactly_one_outcome() {
        let (mut registry, _events) = registry();
        let (reply, rx) = caller();
        let id = registry.create("subscribe", &[], reply).unwrap();

        assert!(registry.complete(id, Ok(json!({"ok": true}))).is_none());
        assert_eq!(rx.await.unwrap().unwrap(), json!({"ok": true}));
        assert!(!registry.contains(id));
        assert!(registry.timers.is_empty());

        // A second completion for the same id finds nothing.
        assert!(registry.complete(id, Ok(Value::Null)).is_none());
    }

    #[tokio::test]
    async fn respond_routes_errors_to_caller() {
        let (mut registry, _events) = registry();
        let (reply, rx) = caller();
        let id = registry.create("subscribe", &[], reply).unwrap();

        registry.respond(Incoming::Failure {
            id: json!(id),
            error: RpcErrorObject {
                code: -32602,
                message: "Invalid params".into(),
                data: None,
            },
        });

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, SnapperError::Rpc { code: -32602, .. }));
    }

    #[tokio::test]
    async fn unmatched_response_is_a_warning() {
        let (mut registry, mut events) = registry();
        let response = Incoming::Success {
            id: json!(404),
            result: json!(true),
        };
        assert!(registry.respond(response.clone()).is_none());

        match events.recv().await.unwrap() {
            SnapperEvent::Warn(warned) => assert_eq!(warned, response),
            other => panic!("expected Warn, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn detached_outcomes_become_events() {
        let (mut registry, mut events) = registry();
        let ok = registry.create("publish", &[], Reply::Detached).unwrap();
        let failed = registry.create("publish", &[], Reply::Detached).unwrap();

        registry.complete(ok, Ok(json!(1)));
        registry.complete(failed, Err(SnapperError::TransportClosed));

        assert!(matches!(
            events.recv().await.unwrap(),
            SnapperEvent::Jsonrpc { id, .. } if id == ok
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            SnapperEvent::Error(SnapperError::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn internal_outcome_is_handed_back() {
        let (mut registry, _events) = registry();
        let id = registry.create("auth", &[json!("tok")], Reply::Internal).unwrap();
        let (got, outcome) = registry
            .respond(Incoming::Success {
                id: json!(id),
                result: json!({"id": "session-1"}),
            })
            .unwrap();
        assert_eq!(got, id);
        assert_eq!(outcome.unwrap(), json!({"id": "session-1"}));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_completes_only_that_command() {
        let (mut registry, _events) = registry();
        let (reply, rx) = caller();
        let id = registry.create("subscribe", &[], reply).unwrap();

        let expired = registry.next_expired().await.unwrap();
        assert_eq!(expired, id);
        registry.expire(expired);

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, SnapperError::Timeout { id: t, .. } if t == id));
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_command_never_times_out() {
        let (mut registry, _events) = registry();
        let done = registry.create("subscribe", &[], Reply::Detached).unwrap();
        registry.complete(done, Ok(Value::Null));
        assert!(registry.next_expired().await.is_none());

        tokio::time::advance(Duration::from_secs(30)).await;
        let later = registry.create("subscribe", &[], Reply::Detached).unwrap();
        assert_eq!(registry.next_expired().await, Some(later));
    }

    #[tokio::test]
    async fn unsent_ids_are_ascending_and_track_sends() {
        let (mut registry, _events) = registry();
        let ids: Vec<u64> = (0..5)
            .map(|_| registry.create("subscribe", &[], Reply::Detached).unwrap())
            .collect();

        registry.mark_sent(ids[1]);
        registry.mark_sent(ids[3]);
        assert_eq!(registry.unsent_ids(), vec![ids[0], ids[2], ids[4]]);

        registry.mark_all_unsent();
        assert_eq!(registry.unsent_ids(), ids);
    }

    #[tokio::test]
    async fn fail_all_completes_everything_and_clears_timers() {
        let (mut registry, _events) = registry();
        let receivers: Vec<_> = (0..3)
            .map(|_| {
                let (reply, rx) = caller();
                registry.create("subscribe", &[], reply).unwrap();
                rx
            })
            .collect();

        registry.fail_all(|| SnapperError::Closed);

        for rx in receivers {
            assert!(matches!(rx.await.unwrap(), Err(SnapperError::Closed)));
        }
        assert_eq!(registry.len(), 0);
        assert!(registry.timers.is_empty());
    }

    #[tokio::test]
    async fn discard_is_silent() {
        let (mut registry, mut events) = registry();
        let id = registry.create("auth", &[], Reply::Detached).unwrap();
        assert!(registry.discard(id));
        assert!(!registry.discard(id));
        assert!(events.try_recv().is_err());
        assert!(registry.timers.is_empty());
    }
}
