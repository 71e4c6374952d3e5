// This file is part of the 'isotp' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Sliding-window bitrate cap on outgoing frames.
//!
//! Driven by an injected clock rather than `Instant::now()` directly so
//! tests can advance time deterministically without sleeping.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Tracks `(timestamp, bits)` samples over a trailing window and decides
/// whether sending `bits` more right now would exceed the configured
/// bitrate.
pub struct RateLimiter {
    max_bitrate: u64,
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    bits_in_window: u64,
}

impl RateLimiter {
    pub fn new(max_bitrate: u64, window: Duration) -> Self {
        Self { max_bitrate, window, samples: VecDeque::new(), bits_in_window: 0 }
    }

    pub fn set_max_bitrate(&mut self, max_bitrate: u64) {
        self.max_bitrate = max_bitrate;
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(&(ts, bits)) = self.samples.front() {
            if now.saturating_duration_since(ts) > self.window {
                self.bits_in_window -= bits;
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// True if `frame_bits` more bits can be sent right now without the
    /// trailing-window average exceeding `max_bitrate`.
    pub fn allow(&mut self, now: Instant, frame_bits: u64) -> bool {
        self.evict_expired(now);
        if self.max_bitrate == 0 {
            return true;
        }
        let window_secs = self.window.as_secs_f64().max(f64::MIN_POSITIVE);
        let budget_bits = (self.max_bitrate as f64 * window_secs) as u64;
        self.bits_in_window + frame_bits <= budget_bits
    }

    /// Record that `frame_bits` bits were actually sent at `now`.
    pub fn record(&mut self, now: Instant, frame_bits: u64) {
        self.evict_expired(now);
        self.samples.push_back((now, frame_bits));
        self.bits_in_window += frame_bits;
    }

    /// How much longer the caller should wait before the next send would
    /// be allowed, or `Duration::ZERO` if it is allowed right now.
    pub fn next_available_in(&mut self, now: Instant, frame_bits: u64) -> Duration {
        if self.allow(now, frame_bits) {
            return Duration::ZERO;
        }
        // the earliest a slot frees up is when the oldest sample falls
        // out of the trailing window.
        match self.samples.front() {
            Some(&(ts, _)) => (ts + self.window).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }
}
