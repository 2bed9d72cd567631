//! Leaky-bucket rate control.
//!
//! Two buckets govern the send path: one bounds original data and SPMs by
//! the configured transmit-window rate, the other bounds repair traffic
//! (RDATA and NCFs). Refill is lazy, computed in integer microseconds on
//! each check.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Accept,
    /// Not enough tokens; retry after the returned duration.
    Defer(Duration),
}

/// A token bucket in units of bytes. A rate of zero disables the bucket.
#[derive(Debug, Clone)]
pub struct RateBucket {
    rate_per_sec: u64,
    capacity: u64,
    tokens: u64,
    last_refill: Instant,
}

impl RateBucket {
    /// A bucket refilling at `rate_per_sec` bytes per second, holding at
    /// most one second of burst.
    pub fn new(rate_per_sec: u64, now: Instant) -> Self {
        RateBucket {
            rate_per_sec,
            capacity: rate_per_sec.max(1),
            tokens: rate_per_sec.max(1),
            last_refill: now,
        }
    }

    /// An always-accepting bucket.
    pub fn unlimited(now: Instant) -> Self {
        RateBucket {
            rate_per_sec: 0,
            capacity: 0,
            tokens: 0,
            last_refill: now,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate_per_sec == 0
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let added = self.rate_per_sec.saturating_mul(elapsed.as_micros() as u64) / 1_000_000;
        if added > 0 {
            self.tokens = (self.tokens + added).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Whether `n` bytes may be sent now, or how long until they could be.
    pub fn check(&mut self, n: usize, now: Instant) -> RateDecision {
        if self.is_unlimited() {
            return RateDecision::Accept;
        }
        self.refill(now);
        let n = n as u64;
        if self.tokens >= n {
            RateDecision::Accept
        } else {
            let missing = n.min(self.capacity) - self.tokens;
            let micros = missing.saturating_mul(1_000_000).div_ceil(self.rate_per_sec);
            RateDecision::Defer(Duration::from_micros(micros.max(1)))
        }
    }

    /// Debits `n` bytes. Call after an `Accept`.
    pub fn consume(&mut self, n: usize) {
        if !self.is_unlimited() {
            self.tokens = self.tokens.saturating_sub(n as u64);
        }
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_within_burst_then_defers() {
        let t0 = Instant::now();
        let mut bucket = RateBucket::new(1000, t0);
        assert_eq!(bucket.check(600, t0), RateDecision::Accept);
        bucket.consume(600);
        assert_eq!(bucket.check(400, t0), RateDecision::Accept);
        bucket.consume(400);
        match bucket.check(500, t0) {
            RateDecision::Defer(d) => assert_eq!(d, Duration::from_micros(500_000)),
            other => panic!("expected defer, got {other:?}"),
        }
    }

    #[test]
    fn lazy_refill_restores_tokens() {
        let t0 = Instant::now();
        let mut bucket = RateBucket::new(1000, t0);
        bucket.consume(1000);
        let t1 = t0 + Duration::from_millis(250);
        assert_eq!(bucket.check(250, t1), RateDecision::Accept);
        assert_eq!(bucket.check(251, t1), RateDecision::Defer(Duration::from_millis(1)));
    }

    #[test]
    fn refill_caps_at_capacity() {
        let t0 = Instant::now();
        let mut bucket = RateBucket::new(1000, t0);
        let later = t0 + Duration::from_secs(60);
        bucket.refill(later);
        assert_eq!(bucket.tokens(), 1000);
    }

    #[test]
    fn zero_rate_always_accepts() {
        let t0 = Instant::now();
        let mut bucket = RateBucket::unlimited(t0);
        assert_eq!(bucket.check(usize::MAX, t0), RateDecision::Accept);
        bucket.consume(1 << 30);
        assert_eq!(bucket.check(1 << 30, t0), RateDecision::Accept);
    }
}
