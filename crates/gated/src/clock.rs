//! Millisecond wall clock.
//!
//! Timestamps are passed into registry/limiter/login paths as plain `i64`
//! so tests can pin time.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
