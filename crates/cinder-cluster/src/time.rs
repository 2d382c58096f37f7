//! Monotonic time utilities.
//!
//! Health monitoring and slow-access detection must never observe time
//! jumping backwards, so everything here is anchored to a process-local
//! monotonic clock rather than the wall clock. NTP slew still nudges the
//! rate slightly, but never discontinuously.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// A monotonic timestamp: the duration since process start.
pub type Timestamp = Duration;

fn anchor() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

/// Returns the current monotonic timestamp.
pub fn now() -> Timestamp {
    anchor().elapsed()
}

/// Returns the current monotonic timestamp in milliseconds.
pub fn now_ms() -> u64 {
    now().as_millis() as u64
}

/// Returns how much time has passed since `earlier`, saturating to zero
/// if `earlier` is in the future (possible across threads racing on the
/// same clock read).
pub fn elapsed_since(earlier: Timestamp) -> Duration {
    now().saturating_sub(earlier)
}
