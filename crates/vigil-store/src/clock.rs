//! Process-wide update clock.
//!
//! Stamps are milliseconds since the Unix epoch, but never repeat and never
//! go backwards within a process, so "least recently updated" is a total order.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

static LAST_STAMP: AtomicI64 = AtomicI64::new(0);

/// How far past the wall clock a loaded stamp may lie before it is distrusted.
pub const MAX_FUTURE_SKEW_MS: i64 = 24 * 60 * 60 * 1000;

/// Next update stamp: wall-clock milliseconds, bumped past the previous stamp if needed.
pub fn next_stamp() -> i64 {
    let now = Utc::now().timestamp_millis();
    let mut prev = LAST_STAMP.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev.saturating_add(1));
        match LAST_STAMP.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

/// Record a stamp seen elsewhere (e.g. loaded from a snapshot) so later stamps sort after it.
pub fn observe(stamp: i64) {
    LAST_STAMP.fetch_max(stamp, Ordering::AcqRel);
}

/// False for stamps too far in the future to have come from a sane clock.
pub fn is_plausible(stamp: i64) -> bool {
    stamp <= Utc::now().timestamp_millis().saturating_add(MAX_FUTURE_SKEW_MS)
}
