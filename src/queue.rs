//! Batching queue for fire-and-forget messages.
//!
//! [`SnapperClient::send_message`](crate::SnapperClient::send_message) never
//! waits: each `(room, message)` pair is appended here and later drained into
//! `publish` RPCs of at most `batch_size` pairs. Draining stops while the
//! number of live commands is at the high-water mark, so a stalled server
//! bounds the number of in-flight RPCs rather than the queue length. The
//! queue itself is unbounded.

use std::collections::VecDeque;

use serde_json::Value;

#[derive(Debug)]
pub(crate) struct OutboundQueue {
    items: VecDeque<(String, Value)>,
    batch_size: usize,
    high_water: usize,
}

impl OutboundQueue {
    pub(crate) fn new(batch_size: usize, high_water: usize) -> Self {
        Self {
            items: VecDeque::new(),
            batch_size: batch_size.max(1),
            high_water: high_water.max(1),
        }
    }

    pub(crate) fn push(&mut self, room: String, message: Value) {
        self.items.push_back((room, message));
    }

    /// Drain the next batch as `publish` params, each entry a `[room, message]`
    /// pair in push order.
    ///
    /// Returns `None` when the queue is empty or `in_flight` has reached the
    /// high-water mark.
    pub(crate) fn next_batch(&mut self, in_flight: usize) -> Option<Vec<Value>> {
        if self.items.is_empty() || in_flight >= self.high_water {
            return None;
        }
        let n = self.batch_size.min(self.items.len());
        Some(
            self.items
                .drain(..n)
                .map(|(room, message)| Value::Array(vec![Value::String(room), message]))
                .collect(),
        )
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    /// Drop everything still queued, returning how many messages were lost.
    pub(crate) fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn batches_preserve_push_order() {
        let mut queue = OutboundQueue::new(2, 10);
        for i in 0..5 {
            queue.push(format!("room{i}"), json!(i));
        }

        assert_eq!(
            queue.next_batch(0).unwrap(),
            vec![json!(["room0", 0]), json!(["room1", 1])]
        );
        assert_eq!(
            queue.next_batch(0).unwrap(),
            vec![json!(["room2", 2]), json!(["room3", 3])]
        );
        assert_eq!(queue.next_batch(0).unwrap(), vec![json!(["room4", 4])]);
        assert!(queue.next_batch(0).is_none());
    }

    #[test]
    fn high_water_mark_stops_draining() {
        let mut queue = OutboundQueue::new(1, 3);
        queue.push("r".into(), json!("m"));

        assert!(queue.next_batch(3).is_none());
        assert!(queue.next_batch(4).is_none());
        assert_eq!(queue.len(), 1);
        assert!(queue.next_batch(2).is_some());
    }

    #[test]
    fn push_is_unbounded() {
        let mut queue = OutboundQueue::new(50, 1);
        for i in 0..10_000 {
            queue.push("r".into(), json!(i));
        }
        assert_eq!(queue.len(), 10_000);
        assert_eq!(queue.clear(), 10_000);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn zero_sizes_are_clamped() {
        let mut queue = OutboundQueue::new(0, 0);
        queue.push("r".into(), json!(1));
        queue.push("r".into(), json!(2));
        assert_eq!(queue.next_batch(0).unwrap().len(), 1);
    }
}
