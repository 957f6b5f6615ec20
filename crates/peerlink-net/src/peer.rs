//! Per-peer connection record
//!
//! Shared between the transport receive path, the keep-alive timer, and
//! the orchestrator, so both fields are atomic. The last-activity instant
//! is stored as milliseconds since construction; `Instant` itself has no
//! atomic form.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Connection liveness record for the (single) peer
pub struct PeerRecord {
    base: Instant,
    last_activity_ms: AtomicU64,
    connected: AtomicBool,
}

impl PeerRecord {
    /// Create a record with activity initialized to now
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            connected: AtomicBool::new(false),
        }
    }

    /// Record activity at the current instant
    pub fn update_activity(&self) {
        let elapsed = self.base.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Release);
    }

    /// Time since the last recorded activity
    pub fn idle_time(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire));
        self.base.elapsed().saturating_sub(last)
    }

    /// Whether the peer has been silent longer than `timeout` while connected
    pub fn has_timed_out(&self, timeout: Duration) -> bool {
        self.idle_time() > timeout && self.is_connected()
    }

    /// Set the connected flag; connecting also counts as activity
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
        if connected {
            self.update_activity();
        }
    }

    /// Whether the peer is currently marked connected
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl Default for PeerRecord {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_starts_disconnected() {
        let peer = PeerRecord::new();
        assert!(!peer.is_connected());
        assert!(!peer.has_timed_out(Duration::ZERO));
    }

    #[test]
    fn test_set_connected_updates_activity() {
        let peer = PeerRecord::new();
        sleep(Duration::from_millis(20));

        peer.set_connected(true);
        assert!(peer.is_connected());
        assert!(peer.idle_time() < Duration::from_millis(15));
    }

    #[test]
    fn test_timeout_requires_connected() {
        let peer = PeerRecord::new();
        sleep(Duration::from_millis(30));

        // Silent but never connected: no timeout
        assert!(!peer.has_timed_out(Duration::from_millis(10)));

        peer.set_connected(true);
        sleep(Duration::from_millis(30));
        assert!(peer.has_timed_out(Duration::from_millis(10)));
        assert!(!peer.has_timed_out(Duration::from_secs(60)));
    }

    #[test]
    fn test_activity_resets_timeout() {
        let peer = PeerRecord::new();
        peer.set_connected(true);
        sleep(Duration::from_millis(30));

        peer.update_activity();
        assert!(!peer.has_timed_out(Duration::from_millis(20)));
    }
}
