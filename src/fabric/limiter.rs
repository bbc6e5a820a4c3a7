//! Token-bucket rate limiter with a priority wait queue.
//!
//! Each named channel owns a bucket `(rate_per_sec, burst)`. A request
//! consumes one token; when the bucket is empty the caller parks in a
//! priority queue (lower priority number served first, FIFO within a
//! priority) bounded by the configured wait cap. Bucket state updates
//! happen in one short critical section over `(tokens, last_refill)`.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone)]
struct Waiter {
    priority: u8,
    ticket: u64,
    notify: Arc<Notify>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.ticket == other.ticket
    }
}
impl Eq for Waiter {}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the lowest (priority, ticket)
        // pair sits at the top.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.ticket.cmp(&self.ticket))
    }
}
impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Observability snapshot for one bucket.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterMetrics {
    pub name: String,
    pub available_tokens: f64,
    pub queued_waiters: usize,
}

#[derive(Debug)]
pub struct TokenBucket {
    name: String,
    rate_per_sec: f64,
    burst: f64,
    wait_cap: Duration,
    state: Mutex<BucketState>,
    queue: Mutex<BinaryHeap<Waiter>>,
    next_ticket: AtomicU64,
}

impl TokenBucket {
    pub fn new(
        name: impl Into<String>,
        rate_per_sec: f64,
        burst: u32,
        wait_cap: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            rate_per_sec,
            burst: burst as f64,
            wait_cap,
            state: Mutex::new(BucketState { tokens: burst as f64, last_refill: Instant::now() }),
            queue: Mutex::new(BinaryHeap::new()),
            next_ticket: AtomicU64::new(0),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
        state.last_refill = Instant::now();
    }

    /// Take a token without waiting.
    pub fn try_acquire(&self) -> bool {
        let queue_empty = self.queue.lock().expect("limiter queue lock").is_empty();
        if !queue_empty {
            return false;
        }
        let mut state = self.state.lock().expect("limiter state lock");
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take a token, waiting in priority order up to the smaller of the
    /// caller deadline and the configured wait cap.
    pub async fn acquire(
        &self,
        priority: u8,
        caller_deadline: Duration,
    ) -> Result<(), crate::fabric::FabricError> {
        let ticket = self.next_ticket.fetch_add(1, AtomicOrdering::Relaxed);
        let notify = Arc::new(Notify::new());
        {
            let mut queue = self.queue.lock().expect("limiter queue lock");
            queue.push(Waiter { priority, ticket, notify: notify.clone() });
        }

        let deadline = Instant::now() + caller_deadline.min(self.wait_cap);

        loop {
            // Head check and token grab under the two short locks.
            let wait_hint = {
                let mut queue = self.queue.lock().expect("limiter queue lock");
                let is_head = queue.peek().map(|w| w.ticket == ticket).unwrap_or(false);
                if is_head {
                    let mut state = self.state.lock().expect("limiter state lock");
                    self.refill(&mut state);
                    if state.tokens >= 1.0 {
                        state.tokens -= 1.0;
                        queue.pop();
                        if let Some(next) = queue.peek() {
                            next.notify.notify_one();
                        }
                        return Ok(());
                    }
                    // Time until one token accrues.
                    let deficit = 1.0 - state.tokens;
                    Some(Duration::from_secs_f64(deficit / self.rate_per_sec))
                } else {
                    None
                }
            };

            let now = Instant::now();
            if now >= deadline {
                self.remove_waiter(ticket);
                debug!(channel = %self.name, "rate limit wait exhausted");
                return Err(crate::fabric::FabricError::Throttled { channel: self.name.clone() });
            }
            let remaining = deadline - now;

            match wait_hint {
                Some(until_token) => {
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = tokio::time::sleep(until_token.min(remaining)) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = tokio::time::sleep(remaining) => {}
                    }
                }
            }
        }
    }

    fn remove_waiter(&self, ticket: u64) {
        let mut queue = self.queue.lock().expect("limiter queue lock");
        let remaining: BinaryHeap<Waiter> =
            queue.drain().filter(|w| w.ticket != ticket).collect();
        *queue = remaining;
        if let Some(next) = queue.peek() {
            next.notify.notify_one();
        }
    }

    pub fn metrics(&self) -> LimiterMetrics {
        // Lock order elsewhere is queue then state; never hold both here.
        let available_tokens = {
            let mut state = self.state.lock().expect("limiter state lock");
            self.refill(&mut state);
            state.tokens
        };
        let queued_waiters = self.queue.lock().expect("limiter queue lock").len();
        LimiterMetrics { name: self.name.clone(), available_tokens, queued_waiters }
    }
}
