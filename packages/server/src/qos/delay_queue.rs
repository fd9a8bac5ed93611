//! Expiration-ordered queue of throttled requests.
//!
//! Entries become visible to consumers once their expiration time has passed
//! and are released in non-decreasing expiration order; entries with equal
//! expiration leave in insertion order.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relaybus_core::ClockSource;
use serde::Serialize;
use tokio::sync::Notify;

/// A request rejected by a throttling policy, waiting out its backoff delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThrottledRequest {
    pub policy_id: String,
    pub client_id: String,
    /// Time (ms since epoch) at which the request may be retried.
    pub expiration_ms: u64,
    /// Insertion sequence number, breaks expiration ties.
    seq: u64,
}

impl ThrottledRequest {
    /// Milliseconds left until the request may be retried.
    #[must_use]
    pub fn remaining_ms(&self, now: u64) -> u64 {
        self.expiration_ms.saturating_sub(now)
    }
}

impl Ord for ThrottledRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.expiration_ms
            .cmp(&other.expiration_ms)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for ThrottledRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of [`ThrottledRequest`]s keyed by expiration.
#[derive(Debug)]
pub struct DelayQueue {
    heap: Mutex<BinaryHeap<Reverse<ThrottledRequest>>>,
    next_seq: AtomicU64,
    notify: Notify,
    clock: Arc<dyn ClockSource>,
}

impl DelayQueue {
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            next_seq: AtomicU64::new(0),
            notify: Notify::new(),
            clock,
        }
    }

    /// Enqueues a request that becomes available after `delay_ms`.
    pub fn push(&self, policy_id: &str, client_id: &str, delay_ms: u64) -> ThrottledRequest {
        let request = ThrottledRequest {
            policy_id: policy_id.to_string(),
            client_id: client_id.to_string(),
            expiration_ms: self.clock.now().saturating_add(delay_ms),
            seq: self.next_seq.fetch_add(1, AtomicOrdering::Relaxed),
        };
        self.heap.lock().push(Reverse(request.clone()));
        // A new head may expire sooner than the one the consumer is sleeping on.
        self.notify.notify_one();
        request
    }

    /// Pops the head if it has expired.
    pub fn poll_expired(&self) -> Option<ThrottledRequest> {
        let now = self.clock.now();
        let mut heap = self.heap.lock();
        let head_expiration = heap.peek().map(|Reverse(r)| r.expiration_ms)?;
        if head_expiration <= now {
            heap.pop().map(|Reverse(r)| r)
        } else {
            None
        }
    }

    /// Waits until the head has expired and pops it.
    ///
    /// Sleeps until the head's expiration, waking early when a push may have
    /// installed an earlier head. Intended for a single consumer task.
    pub async fn take(&self) -> ThrottledRequest {
        loop {
            let wait_ms = {
                let now = self.clock.now();
                let mut heap = self.heap.lock();
                match heap.peek().map(|Reverse(r)| r.expiration_ms) {
                    Some(expiration) if expiration <= now => {
                        if let Some(Reverse(request)) = heap.pop() {
                            return request;
                        }
                        None
                    }
                    Some(expiration) => Some(expiration - now),
                    None => None,
                }
            };

            match wait_ms {
                Some(ms) => {
                    tokio::select! {
                        () = self.notify.notified() => {}
                        () = tokio::time::sleep(Duration::from_millis(ms)) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Expiration of the current head, if any.
    #[must_use]
    pub fn peek_expiration(&self) -> Option<u64> {
        self.heap.lock().peek().map(|Reverse(r)| r.expiration_ms)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    /// Drops every queued request.
    pub fn clear(&self) {
        self.heap.lock().clear();
    }
}
