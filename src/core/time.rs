// src/core/time.rs

//! Coarse cached clock. The master and worker loops call `update` once per
//! iteration; everything that needs "now" inside that iteration reads the
//! cached value instead of issuing its own clock syscalls. Readers and the
//! updater may live on different sides of a signal boundary, so the cache is
//! a pair of atomics.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;

static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds of monotonic time since process start, as of the last update.
static CACHED_MONOTONIC_MS: AtomicU64 = AtomicU64::new(0);

/// Unix milliseconds as of the last update.
static CACHED_UNIX_MS: AtomicI64 = AtomicI64::new(0);

/// Refreshes the cached clock snapshot. Called at the top of each supervisor
/// loop iteration and as the first step of a cycle build.
pub fn update() {
    let mono = START.elapsed().as_millis() as u64;
    let unix = Utc::now().timestamp_millis();
    CACHED_MONOTONIC_MS.store(mono, Ordering::Release);
    CACHED_UNIX_MS.store(unix, Ordering::Release);
}

/// Cached monotonic milliseconds since process start. Timers are expressed
/// against this value.
pub fn monotonic_ms() -> u64 {
    CACHED_MONOTONIC_MS.load(Ordering::Acquire)
}

/// Cached wall-clock time of the last update.
pub fn now() -> DateTime<Utc> {
    let ms = CACHED_UNIX_MS.load(Ordering::Acquire);
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_is_monotonic() {
        update();
        let a = monotonic_ms();
        update();
        let b = monotonic_ms();
        assert!(b >= a);
    }

    #[test]
    fn wall_clock_is_cached_between_updates() {
        update();
        let a = now();
        let b = now();
        assert_eq!(a, b);
    }
}
