//! Request-shaping rate limiter - three continuously refilled token buckets
//!
//! Enforces requests/min, input-tokens/min and output-tokens/min against
//! pre-flight estimates. Callers either debit immediately, wait in a FIFO
//! queue, or fail with a typed error naming the dominant limit.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::llm::types::{RequestEstimate, TokenUsage};

/// Poll granularity for queued callers
const QUEUE_POLL_MS: u64 = 100;

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests per minute
    pub rpm: u32,
    /// Input tokens per minute
    pub itpm: u64,
    /// Output tokens per minute
    pub otpm: u64,
    /// Queue callers instead of failing when a bucket is short
    pub queue_when_limited: bool,
    /// Maximum queued callers before rejecting with queue_full
    pub max_queue_size: usize,
    /// How long a queued caller may wait before timing out
    pub queue_timeout_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rpm: 60,
            itpm: 100_000,
            otpm: 20_000,
            queue_when_limited: true,
            max_queue_size: 100,
            queue_timeout_ms: 60_000,
        }
    }
}

/// Partial update for [`RateLimitConfig`]; unset fields keep their value
#[derive(Debug, Clone, Default)]
pub struct RateLimitUpdate {
    pub rpm: Option<u32>,
    pub itpm: Option<u64>,
    pub otpm: Option<u64>,
    pub queue_when_limited: Option<bool>,
    pub max_queue_size: Option<usize>,
    pub queue_timeout_ms: Option<u64>,
}

/// Which limit rejected the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Rpm,
    Itpm,
    Otpm,
    QueueFull,
    Timeout,
}

impl LimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::Rpm => "rpm",
            LimitKind::Itpm => "itpm",
            LimitKind::Otpm => "otpm",
            LimitKind::QueueFull => "queue_full",
            LimitKind::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("rate limited ({kind}), retry in {wait_ms} ms")]
pub struct RateLimitError {
    pub kind: LimitKind,
    /// Remaining wait at the time of rejection
    pub wait_ms: u64,
}

/// Successful acquire: how long the caller waited and where it sat
#[derive(Debug, Clone, Copy, Default)]
pub struct AcquireReceipt {
    pub waited_ms: u64,
    pub queue_position: usize,
    /// The limit that forced the caller to queue, if any
    pub limited_by: Option<LimitKind>,
}

/// Snapshot of current bucket levels, for monitoring
#[derive(Debug, Clone, Copy)]
pub struct LimiterState {
    pub request_tokens: f64,
    pub input_tokens: f64,
    pub output_tokens: f64,
    pub queue_len: usize,
}

/// One continuously refilled bucket
#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Refill by elapsed time at `capacity_per_minute`, clamped to capacity.
    fn refill(&mut self, capacity_per_minute: f64, now: Instant) {
        let elapsed_ms = now.duration_since(self.last_refill).as_millis() as f64;
        self.tokens =
            (self.tokens + capacity_per_minute / 60_000.0 * elapsed_ms).min(capacity_per_minute);
        self.last_refill = now;
    }

    /// Milliseconds until `needed` tokens are available; 0 if already there.
    fn wait_ms(&self, needed: f64, capacity_per_minute: f64) -> u64 {
        if needed <= self.tokens {
            return 0;
        }
        if capacity_per_minute <= 0.0 {
            return u64::MAX;
        }
        ((needed - self.tokens) * 60_000.0 / capacity_per_minute).ceil() as u64
    }
}

#[derive(Debug, Clone, Copy)]
struct Ticket {
    id: u64,
    deadline: Instant,
}

struct LimiterInner {
    config: RateLimitConfig,
    requests: Bucket,
    input: Bucket,
    output: Bucket,
    queue: VecDeque<Ticket>,
    next_ticket: u64,
    last_actual: Option<TokenUsage>,
}

impl LimiterInner {
    fn refill_all(&mut self, now: Instant) {
        self.requests.refill(self.config.rpm as f64, now);
        self.input.refill(self.config.itpm as f64, now);
        self.output.refill(self.config.otpm as f64, now);
    }

    /// (wait_ms, dominant limit) for the given estimate
    fn wait_for(&self, estimate: &RequestEstimate) -> (u64, LimitKind) {
        let waits = [
            (
                self.requests.wait_ms(1.0, self.config.rpm as f64),
                LimitKind::Rpm,
            ),
            (
                self.input
                    .wait_ms(estimate.input_tokens as f64, self.config.itpm as f64),
                LimitKind::Itpm,
            ),
            (
                self.output
                    .wait_ms(estimate.output_tokens as f64, self.config.otpm as f64),
                LimitKind::Otpm,
            ),
        ];
        waits
            .into_iter()
            .max_by_key(|(wait, _)| *wait)
            .unwrap_or((0, LimitKind::Rpm))
    }

    fn debit(&mut self, estimate: &RequestEstimate) {
        self.requests.tokens -= 1.0;
        self.input.tokens -= estimate.input_tokens as f64;
        self.output.tokens -= estimate.output_tokens as f64;
    }

    /// Drop queue entries whose deadline passed; their owners will observe
    /// the timeout on their next poll regardless of queue membership.
    fn purge_expired(&mut self, now: Instant) {
        self.queue.retain(|t| t.deadline > now);
    }
}

/// Thread-safe token-bucket limiter
pub struct RateLimiter {
    inner: Mutex<LimiterInner>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let now = Instant::now();
        let inner = LimiterInner {
            requests: Bucket::full(config.rpm as f64, now),
            input: Bucket::full(config.itpm as f64, now),
            output: Bucket::full(config.otpm as f64, now),
            queue: VecDeque::new(),
            next_ticket: 0,
            last_actual: None,
            config,
        };
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Debit one request plus the estimated tokens, waiting in FIFO order
    /// if a bucket is short. No partial debits: either all three buckets
    /// are debited or the caller gets a typed error.
    pub async fn acquire(&self, estimate: RequestEstimate) -> Result<AcquireReceipt, RateLimitError> {
        let enqueued_at = Instant::now();
        let (ticket, queue_position, limited_by) = {
            let mut inner = self.inner.lock().expect("limiter lock poisoned");
            let now = Instant::now();
            inner.refill_all(now);
            inner.purge_expired(now);

            let (wait, kind) = inner.wait_for(&estimate);
            if wait == 0 && inner.queue.is_empty() {
                inner.debit(&estimate);
                return Ok(AcquireReceipt::default());
            }

            if !inner.config.queue_when_limited {
                return Err(RateLimitError { kind, wait_ms: wait });
            }
            if inner.config.queue_timeout_ms == 0 {
                return Err(RateLimitError {
                    kind: LimitKind::Timeout,
                    wait_ms: wait,
                });
            }
            if inner.queue.len() >= inner.config.max_queue_size {
                return Err(RateLimitError {
                    kind: LimitKind::QueueFull,
                    wait_ms: wait,
                });
            }

            let ticket = Ticket {
                id: inner.next_ticket,
                deadline: now + Duration::from_millis(inner.config.queue_timeout_ms),
            };
            inner.next_ticket += 1;
            inner.queue.push_back(ticket);
            (ticket, inner.queue.len(), kind)
        };

        loop {
            let wait = {
                let mut inner = self.inner.lock().expect("limiter lock poisoned");
                let now = Instant::now();
                inner.refill_all(now);

                if now >= ticket.deadline {
                    inner.queue.retain(|t| t.id != ticket.id);
                    let (wait, _) = inner.wait_for(&estimate);
                    return Err(RateLimitError {
                        kind: LimitKind::Timeout,
                        wait_ms: wait,
                    });
                }
                inner.purge_expired(now);

                let (wait, _) = inner.wait_for(&estimate);
                let is_head = inner.queue.front().map(|t| t.id) == Some(ticket.id);
                if is_head && wait == 0 {
                    inner.debit(&estimate);
                    inner.queue.pop_front();
                    return Ok(AcquireReceipt {
                        waited_ms: enqueued_at.elapsed().as_millis() as u64,
                        queue_position,
                        limited_by: Some(limited_by),
                    });
                }
                wait
            };

            let sleep_ms = wait.clamp(1, QUEUE_POLL_MS);
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }
    }

    /// Record realized usage so callers can tighten future estimates.
    /// Never refunds bucket tokens.
    pub fn report_actual(&self, actual: TokenUsage) {
        let mut inner = self.inner.lock().expect("limiter lock poisoned");
        inner.last_actual = Some(actual);
    }

    /// Most recent realized usage reported via [`Self::report_actual`]
    pub fn last_actual(&self) -> Option<TokenUsage> {
        self.inner.lock().expect("limiter lock poisoned").last_actual
    }

    /// Current bucket levels, refilled to now
    pub fn get_state(&self) -> LimiterState {
        let mut inner = self.inner.lock().expect("limiter lock poisoned");
        inner.refill_all(Instant::now());
        LimiterState {
            request_tokens: inner.requests.tokens,
            input_tokens: inner.input.tokens,
            output_tokens: inner.output.tokens,
            queue_len: inner.queue.len(),
        }
    }

    /// Apply a partial config update; bucket tokens are clamped to any
    /// reduced capacity.
    pub fn update_config(&self, update: RateLimitUpdate) {
        let mut inner = self.inner.lock().expect("limiter lock poisoned");
        inner.refill_all(Instant::now());

        if let Some(rpm) = update.rpm {
            inner.config.rpm = rpm;
        }
        if let Some(itpm) = update.itpm {
            inner.config.itpm = itpm;
        }
        if let Some(otpm) = update.otpm {
            inner.config.otpm = otpm;
        }
        if let Some(q) = update.queue_when_limited {
            inner.config.queue_when_limited = q;
        }
        if let Some(size) = update.max_queue_size {
            inner.config.max_queue_size = size;
        }
        if let Some(timeout) = update.queue_timeout_ms {
            inner.config.queue_timeout_ms = timeout;
        }

        inner.requests.tokens = inner.requests.tokens.min(inner.config.rpm as f64);
        inner.input.tokens = inner.input.tokens.min(inner.config.itpm as f64);
        inner.output.tokens = inner.output.tokens.min(inner.config.otpm as f64);
    }

    /// Restore all buckets to full
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("limiter lock poisoned");
        let now = Instant::now();
        inner.requests = Bucket::full(inner.config.rpm as f64, now);
        inner.input = Bucket::full(inner.config.itpm as f64, now);
        inner.output = Bucket::full(inner.config.otpm as f64, now);
    }
}
