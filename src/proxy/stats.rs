//! Sliding-window request rate.
//!
//! One bucket per second over a ten-second window. Each bucket packs the
//! second it belongs to and its count into a single `AtomicU64`, so a
//! recording either lands in the current second or resets a stale bucket
//! atomically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

const WINDOW_SECS: u64 = 10;
const COUNT_BITS: u32 = 24;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;

pub struct RequestStats {
    started: Instant,
    buckets: [AtomicU64; WINDOW_SECS as usize],
}

impl Default for RequestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn record(&self) {
        self.record_at(self.elapsed_secs());
    }

    /// Average requests per second over the window, rounded to two decimals.
    pub fn requests_per_second(&self) -> f64 {
        self.rate_at(self.elapsed_secs())
    }

    // Seconds are offset by one so a zeroed bucket never matches second 0.
    fn elapsed_secs(&self) -> u64 {
        self.started.elapsed().as_secs() + 1
    }

    fn record_at(&self, second: u64) {
        let bucket = &self.buckets[(second % WINDOW_SECS) as usize];
        let mut current = bucket.load(Ordering::Relaxed);
        loop {
            let next = if current >> COUNT_BITS == second {
                let count = (current & COUNT_MASK).saturating_add(1).min(COUNT_MASK);
                (second << COUNT_BITS) | count
            } else {
                (second << COUNT_BITS) | 1
            };
            match bucket.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn rate_at(&self, second: u64) -> f64 {
        let oldest = second.saturating_sub(WINDOW_SECS - 1);
        let total: u64 = self
            .buckets
            .iter()
            .map(|bucket| bucket.load(Ordering::Acquire))
            .filter(|packed| {
                let at = packed >> COUNT_BITS;
                at >= oldest && at <= second
            })
            .map(|packed| packed & COUNT_MASK)
            .sum();
        let rate = total as f64 / WINDOW_SECS as f64;
        (rate * 100.0).round() / 100.0
    }
}
