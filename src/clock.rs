use std::time::{SystemTime, UNIX_EPOCH};

/// A source of message timestamps.
///
/// Timestamps are microseconds since the UNIX epoch (UTC), the unit used by
/// received messages and by event-log records.
pub trait Clock: Send + Sync + 'static {
    fn now_us(&self) -> i64;
}

/// A clock that uses `std::time::SystemTime`.
///
/// Susceptible to NTP adjustments; record timestamps written with it are only
/// as monotonic as the host wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_us(&self) -> i64 {
        // A wall clock before 1970 is reported as the epoch itself.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}
