//! Token-bucket limiter for per-frame traffic logging
//!
//! The tunnel hot path can move tens of thousands of frames per second;
//! logging each one would drown the subscriber. Call sites ask the
//! limiter before emitting a traffic line. The limiter also carries the
//! runtime on/off toggle driven by the `/logs` command (off by default).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Token bucket gating traffic log lines
pub struct TrafficLogLimiter {
    enabled: AtomicBool,
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl TrafficLogLimiter {
    /// Create a limiter with the given burst capacity and refill rate
    /// (logs per second). Starts disabled.
    pub fn new(capacity: u32, logs_per_sec: u32) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            capacity: f64::from(capacity),
            refill_per_sec: f64::from(logs_per_sec),
            bucket: Mutex::new(Bucket {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Whether a traffic log line may be emitted now
    pub fn allow(&self) -> bool {
        if !self.enabled.load(Ordering::Relaxed) {
            return false;
        }

        let mut bucket = self.bucket.lock().expect("limiter mutex poisoned");

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Enable or disable traffic logging entirely
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Flip the enabled flag, returning the new value
    pub fn toggle(&self) -> bool {
        // fetch_xor(true) flips and returns the previous value
        !self.enabled.fetch_xor(true, Ordering::Relaxed)
    }

    /// Whether traffic logging is currently enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_by_default() {
        let limiter = TrafficLogLimiter::new(10, 10);
        assert!(!limiter.is_enabled());
        assert!(!limiter.allow());
    }

    #[test]
    fn test_burst_capacity() {
        let limiter = TrafficLogLimiter::new(3, 1);
        limiter.set_enabled(true);

        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(limiter.allow());
        // Bucket drained, refill is 1/s so the 4th is rejected
        assert!(!limiter.allow());
    }

    #[test]
    fn test_refill() {
        let limiter = TrafficLogLimiter::new(1, 1000);
        limiter.set_enabled(true);

        assert!(limiter.allow());
        assert!(!limiter.allow());

        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(limiter.allow());
    }

    #[test]
    fn test_toggle() {
        let limiter = TrafficLogLimiter::new(10, 10);
        assert!(limiter.toggle());
        assert!(limiter.is_enabled());
        assert!(!limiter.toggle());
        assert!(!limiter.is_enabled());
    }
}
