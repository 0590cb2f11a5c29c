//! Per-device pending-message queues.
//!
//! Client→device messages that arrive while the target machine is offline
//! are buffered here: one bounded FIFO per device, oldest entry evicted on
//! overflow, entries expiring after a short TTL. The proxy drains a device's
//! queue in a single pass when it comes back online; a periodic sweep purges
//! expired entries in between.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;

/// A buffered client→device message awaiting delivery.
pub struct PendingMessage {
    /// The stamped message as it would have been sent.
    pub message: Value,
    pub enqueued: Instant,
    /// Failed delivery attempts. The flush pass is single-shot, so this is
    /// bounded bookkeeping rather than a re-queue driver.
    pub retries: u32,
    /// Session that sent the message, for the delivery notification.
    pub origin_session: String,
}

impl PendingMessage {
    pub fn expired(&self, ttl: Duration) -> bool {
        self.enqueued.elapsed() > ttl
    }
}

/// All pending queues, keyed by device id.
pub struct PendingQueues {
    capacity: usize,
    ttl: Duration,
    queues: Mutex<HashMap<String, VecDeque<PendingMessage>>>,
}

impl PendingQueues {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Append a message to a device's queue, evicting the oldest entry when
    /// the queue is at capacity. Returns the queue length after the insert.
    pub async fn enqueue(&self, device_id: &str, message: Value, origin_session: &str) -> usize {
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(device_id.to_string()).or_default();
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(PendingMessage {
            message,
            enqueued: Instant::now(),
            retries: 0,
            origin_session: origin_session.to_string(),
        });
        queue.len()
    }

    /// Remove and return a device's deliverable entries, in FIFO order.
    /// Expired entries are discarded here.
    pub async fn take(&self, device_id: &str) -> Vec<PendingMessage> {
        let mut queues = self.queues.lock().await;
        let Some(queue) = queues.remove(device_id) else {
            return Vec::new();
        };
        queue
            .into_iter()
            .filter(|entry| !entry.expired(self.ttl))
            .collect()
    }

    /// Number of entries pending for one device.
    pub async fn len(&self, device_id: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(device_id)
            .map_or(0, VecDeque::len)
    }

    /// Total entries across all queues.
    pub async fn total(&self) -> usize {
        self.queues.lock().await.values().map(VecDeque::len).sum()
    }

    /// Purge expired entries and drop now-empty queues. Returns the number
    /// of entries removed.
    pub async fn sweep(&self) -> usize {
        let mut queues = self.queues.lock().await;
        let mut purged = 0;
        for queue in queues.values_mut() {
            let before = queue.len();
            queue.retain(|entry| !entry.expired(self.ttl));
            purged += before - queue.len();
        }
        queues.retain(|_, queue| !queue.is_empty());
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queues(capacity: usize, ttl_ms: u64) -> PendingQueues {
        PendingQueues::new(capacity, Duration::from_millis(ttl_ms))
    }

    #[tokio::test]
    async fn test_enqueue_reports_growing_length() {
        let q = queues(50, 10_000);
        assert_eq!(q.enqueue("BRW-01ABCDEF", json!({"type": "brew_start"}), "s1").await, 1);
        assert_eq!(q.enqueue("BRW-01ABCDEF", json!({"type": "brew_start"}), "s1").await, 2);
        assert_eq!(q.enqueue("BRW-01ABCDEF", json!({"type": "brew_start"}), "s1").await, 3);
        assert_eq!(q.total().await, 3);
    }

    #[tokio::test]
    async fn test_overflow_evicts_oldest() {
        let q = queues(3, 10_000);
        for i in 0..5 {
            q.enqueue("BRW-01ABCDEF", json!({"seq": i}), "s1").await;
        }
        assert_eq!(q.len("BRW-01ABCDEF").await, 3);

        let entries = q.take("BRW-01ABCDEF").await;
        let seqs: Vec<i64> = entries
            .iter()
            .map(|e| e.message["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_take_discards_expired() {
        let q = queues(50, 30);
        q.enqueue("BRW-01ABCDEF", json!({"type": "brew_start"}), "s1").await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        q.enqueue("BRW-01ABCDEF", json!({"type": "brew_stop"}), "s1").await;

        let entries = q.take("BRW-01ABCDEF").await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message["type"], "brew_stop");
        // Queue is removed wholesale by take.
        assert_eq!(q.len("BRW-01ABCDEF").await, 0);
    }

    #[tokio::test]
    async fn test_sweep_purges_and_drops_empty_queues() {
        let q = queues(50, 30);
        q.enqueue("BRW-01ABCDEF", json!({"type": "brew_start"}), "s1").await;
        q.enqueue("BRW-02ABCDEF", json!({"type": "brew_start"}), "s2").await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        q.enqueue("BRW-02ABCDEF", json!({"type": "brew_stop"}), "s2").await;

        assert_eq!(q.sweep().await, 2);
        assert_eq!(q.len("BRW-01ABCDEF").await, 0);
        assert_eq!(q.len("BRW-02ABCDEF").await, 1);
        assert_eq!(q.total().await, 1);
    }

    #[tokio::test]
    async fn test_queues_are_independent_per_device() {
        let q = queues(50, 10_000);
        q.enqueue("BRW-01ABCDEF", json!({"type": "a"}), "s1").await;
        q.enqueue("BRW-02ABCDEF", json!({"type": "b"}), "s2").await;

        let taken = q.take("BRW-01ABCDEF").await;
        assert_eq!(taken.len(), 1);
        assert_eq!(q.len("BRW-02ABCDEF").await, 1);
    }
}
