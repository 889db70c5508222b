//! Inbound and broadcast rate limiting.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

/// Per-session inbound limiter: at most `max_count` frames per
/// `interval_ms` window. A zero interval or count disables it.
pub struct MsgLimiter {
    interval_ms: i64,
    max_count: u32,
    window_start: AtomicI64,
    count: AtomicU32,
}

impl MsgLimiter {
    pub fn new(interval_ms: u64, max_count: u32) -> Self {
        Self {
            interval_ms: interval_ms as i64,
            max_count,
            window_start: AtomicI64::new(0),
            count: AtomicU32::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    pub fn allow(&self, now: i64) -> bool {
        if self.interval_ms <= 0 || self.max_count == 0 {
            return true;
        }
        let start = self.window_start.load(Ordering::Acquire);
        if now - start >= self.interval_ms
            && self
                .window_start
                .compare_exchange(start, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.count.store(1, Ordering::Release);
            return true;
        }
        self.count.fetch_add(1, Ordering::AcqRel) + 1 <= self.max_count
    }
}

/// Registry-wide broadcast spacing. Violations drop the broadcast rather
/// than queue it.
pub struct BroadcastLimiter {
    interval_ms: i64,
    last: AtomicI64,
}

impl BroadcastLimiter {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms: interval_ms as i64,
            last: AtomicI64::new(0),
        }
    }

    pub fn allow(&self, now: i64) -> bool {
        if self.interval_ms <= 0 {
            return true;
        }
        let last = self.last.load(Ordering::Acquire);
        now - last >= self.interval_ms
            && self
                .last
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_limiter_always_allows() {
        let l = MsgLimiter::disabled();
        for i in 0..10_000 {
            assert!(l.allow(i));
        }
    }

    #[test]
    fn window_caps_then_resets() {
        let l = MsgLimiter::new(1000, 3);
        assert!(l.allow(0));
        assert!(l.allow(10));
        assert!(l.allow(20));
        assert!(!l.allow(30));
        // New window.
        assert!(l.allow(1000));
        assert!(l.allow(1010));
    }

    #[test]
    fn broadcast_spacing() {
        let l = BroadcastLimiter::new(500);
        assert!(l.allow(1000));
        assert!(!l.allow(1200));
        assert!(l.allow(1500));
    }
}
