//! Request throttling for the bridge server
//!
//! Generated code runs in a loop more often than one would hope. One bucket
//! is shared by every connection, so a runaway script cannot starve the
//! Tool Service no matter how many sockets it opens.
//!
//! # Token Bucket
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  capacity = burst size          refill = tokens per second   │
//! │                                                              │
//! │  request ──► refill(elapsed) ──► tokens >= 1 ? ──► allow     │
//! │                                       │                      │
//! │                                       └─ no ──► "rate limited"│
//! │                                                 error line   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A denied request still receives exactly one response line; throttling
//! never drops a request silently.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Bucket starting full with `capacity` tokens
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec: refill_per_sec.max(0.0),
            bucket: Mutex::new(Bucket {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            }),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // try_acquire() - consume one token if available
    // ═══════════════════════════════════════════════════════════════════════
    // Refills by elapsed * refill_per_sec (capped at capacity) first, so a
    // quiet period restores the burst allowance.
    // ═══════════════════════════════════════════════════════════════════════
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self
            .bucket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(f64::from(self.capacity));
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until the next token, for the error message
    pub fn retry_after(&self) -> Duration {
        if self.refill_per_sec > 0.0 {
            Duration::from_secs_f64(1.0 / self.refill_per_sec)
        } else {
            Duration::from_secs(1)
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}
