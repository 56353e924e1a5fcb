//! Wall-clock access for time-based effects and the watchdog.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub type Millis = u64;

/// Source of the current wall-clock time.
///
/// Injected into the combat service so tests can drive time by hand.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> Millis;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Millis {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as Millis
    }
}

/// Whole seconds elapsed between two timestamps (zero if `now` is earlier).
pub fn whole_seconds_between(earlier: Millis, now: Millis) -> u32 {
    (now.saturating_sub(earlier) / 1000).min(u64::from(u32::MAX)) as u32
}
