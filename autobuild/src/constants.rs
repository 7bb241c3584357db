//! Central repository for scheduling constants and magic numbers
//!
//! Constants are grouped by the component that owns them so the calculator,
//! the executor and the daemon wiring read from a single source of truth.

use std::time::Duration;

/// Lifecycle executor limits
pub mod executor {
    use uuid::Uuid;

    /// Maximum number of workspaces evaluated concurrently per tick
    pub const MAX_CONCURRENT_EVALUATIONS: usize = 10;

    /// Prefix of the per-workspace named lock
    pub const LOCK_PREFIX: &str = "autobuild";

    /// Cooldown before retrying a delete whose job failed
    pub const FAILED_DELETE_RETRY_HOURS: i64 = 24;

    /// Initiator recorded on builds created by the executor
    pub const SYSTEM_INITIATOR_ID: Uuid = Uuid::from_u128(0x6c6f_6f70_0000_4000_8000_0000_6175_746f);

    /// Source tag attached to enqueued notifications
    pub const NOTIFICATION_SOURCE: &str = "lifecycle_executor";
}

/// Autostop restart requirement constants
pub mod autostop {
    /// Minimum distance between now and the first compliance stop
    pub const REQUIREMENT_LEEWAY_HOURS: i64 = 2;

    /// Subtracted from a candidate day before asking for the next quiet hours occurrence
    pub const REQUIREMENT_BUFFER_MINUTES: i64 = 15;

    /// A candidate day closer than this to now is checked from now plus this
    pub const MIN_STOP_OFFSET_HOURS: i64 = 1;

    /// Upper bound on the restart requirement week cadence
    pub const MAX_REQUIREMENT_WEEKS: i64 = 16;

    /// Minimum remaining runtime when a template policy change tightens a deadline
    pub const POLICY_UPDATE_GRACE_HOURS: i64 = 2;
}

/// Cron search bounds
pub mod cron {
    /// How far ahead a next occurrence search looks before giving up
    pub const MAX_SEARCH_DAYS: u32 = 366 * 5;

    /// Length of the window used to compute the minimum interval
    pub const MIN_INTERVAL_WINDOW_HOURS: i64 = 24 * 7;
}

/// Provisioner daemon availability
pub mod provisioners {
    /// A daemon not seen for longer than this is considered gone
    pub const STALE_INTERVAL_SECONDS: i64 = 90;
}

/// Defaults applied when a config key is absent
pub mod defaults {
    use super::Duration;

    /// Fires at second zero of every minute
    pub const TICK_SCHEDULE: &str = "0 * * * * *";

    /// Quiet hours applied to users without their own schedule
    pub const QUIET_HOURS_SCHEDULE: &str = "CRON_TZ=UTC 0 0 * * *";

    pub const DATABASE_PATH: &str = "data/autobuild.db";

    pub const CONFIG_DIR: &str = "config";

    /// Lease length for database backed locks
    pub const LOCK_LEASE_SECONDS: u64 = 300;

    /// Timeout for outbound webhook and job queue requests
    pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
}
