pub mod manager;

use serde::{Deserialize, Serialize};

use crate::constants::{defaults, executor};

pub use manager::ConfigManager;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_path: String,
    /// Six-field cron (with seconds) driving executor ticks
    pub tick_schedule: String,
    pub max_concurrent_evaluations: usize,
    pub entitlements: EntitlementsConfig,
    pub quiet_hours: QuietHoursConfig,
    pub notifications: NotificationsConfig,
    pub job_queue: JobQueueConfig,
    pub locks: LocksConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: defaults::DATABASE_PATH.to_string(),
            tick_schedule: defaults::TICK_SCHEDULE.to_string(),
            max_concurrent_evaluations: executor::MAX_CONCURRENT_EVALUATIONS,
            entitlements: EntitlementsConfig::default(),
            quiet_hours: QuietHoursConfig::default(),
            notifications: NotificationsConfig::default(),
            job_queue: JobQueueConfig::default(),
            locks: LocksConfig::default(),
        }
    }
}

/// Licensed features. Without them the baseline policy stores are used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EntitlementsConfig {
    pub advanced_template_scheduling: bool,
    pub quiet_hours: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuietHoursConfig {
    pub default_schedule: String,
    pub allow_user_custom: bool,
}

impl Default for QuietHoursConfig {
    fn default() -> Self {
        Self {
            default_schedule: defaults::QUIET_HOURS_SCHEDULE.to_string(),
            allow_user_custom: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    /// Empty disables delivery
    pub webhook_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobQueueConfig {
    /// Provisioner endpoint; jobs stay in process when unset
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    #[default]
    Local,
    Database,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocksConfig {
    pub backend: LockBackend,
    pub lease_seconds: u64,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::Local,
            lease_seconds: defaults::LOCK_LEASE_SECONDS,
        }
    }
}
