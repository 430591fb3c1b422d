//! Injectable wall-clock abstraction
//!
//! Rule evaluation and cron scheduling both read the clock; routing that read
//! through a trait keeps time-dependent behavior deterministic under test.

use std::time::{SystemTime, UNIX_EPOCH};

const MILLIS_PER_MINUTE: i64 = 60_000;
const MINUTES_PER_DAY: i64 = 24 * 60;

/// Source of "now" for the engine
pub trait TimeProvider: Send + Sync + 'static {
    /// Current timestamp in milliseconds since the Unix epoch
    fn now_millis(&self) -> i64;

    /// Minutes past midnight, UTC, ignoring the date
    fn minutes_of_day(&self) -> u16 {
        (self.now_millis() / MILLIS_PER_MINUTE).rem_euclid(MINUTES_PER_DAY) as u16
    }
}

/// Production clock backed by the system time
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("System time before Unix epoch")
            .as_millis() as i64
    }
}

/// Frozen clock for deterministic tests
#[derive(Clone, Copy, Debug)]
pub struct FixedTimeProvider {
    timestamp_ms: i64,
}

impl FixedTimeProvider {
    /// Freeze the clock at an absolute timestamp
    pub fn new(timestamp_ms: i64) -> Self {
        Self { timestamp_ms }
    }

    /// Freeze the clock at the given UTC time of day
    pub fn at_time_of_day(hour: u8, minute: u8) -> Self {
        let minutes = i64::from(hour) * 60 + i64::from(minute);
        Self {
            timestamp_ms: minutes * MILLIS_PER_MINUTE,
        }
    }
}

impl TimeProvider for FixedTimeProvider {
    fn now_millis(&self) -> i64 {
        self.timestamp_ms
    }
}
