//! Common test timestamps and schedules

use chrono::{DateTime, TimeZone, Utc};

/// Fixed instants used across scenarios
pub mod times {
    use super::*;

    /// Tuesday 2024-03-12 14:00 UTC
    pub fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 12, 14, 0, 0).unwrap()
    }

    /// Wednesday 2024-03-13 01:00 UTC, 20:00 CDT on the 12th in Chicago
    pub fn chicago_evening() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 13, 1, 0, 0).unwrap()
    }
}

/// Cron strings
pub mod schedules {
    pub const CHICAGO_8PM: &str = "CRON_TZ=America/Chicago 0 20 * * *";
    pub const UTC_9AM_WEEKDAYS: &str = "CRON_TZ=UTC 0 9 * * 1-5";
    pub const QUIET_HOURS_MIDNIGHT: &str = "CRON_TZ=UTC 0 0 * * *";
}

pub mod durations {
    pub const HOUR_MS: i64 = 3_600_000;
    pub const DAY_MS: i64 = 24 * HOUR_MS;
}
