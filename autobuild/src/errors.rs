//! Error types for the autobuild scheduler
//!
//! Parse and calculation failures are typed so callers can tell a malformed
//! schedule from a broken invariant. Datastore and collaborator failures stay
//! `anyhow::Error`, like the rest of the database layer.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Cron expression parse errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CronError {
    /// Wrong number of whitespace separated fields
    #[error("expected 5 cron fields, got {got}: {raw:?}")]
    FieldCount { raw: String, got: usize },

    /// A field that does not parse or falls outside its domain
    #[error("invalid {field} field {value:?}: {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },

    /// Timezone prefix naming an unknown IANA zone
    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),

    /// `CRON_TZ=Local` depends on the host and is not allowed
    #[error("timezone \"Local\" is not allowed, use an explicit IANA zone")]
    LocalTimezone,

    /// Weekly schedules only vary by minute, hour and day of week
    #[error("weekly schedule {0:?} must use '*' for day-of-month and month")]
    NotWeekly(String),

    /// Daily schedules only vary by minute and hour
    #[error("daily schedule {0:?} must use '*' for day-of-month, month and day-of-week")]
    NotDaily(String),
}

/// Template and user policy errors
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Restart requirement mask or cadence out of range
    #[error("invalid autostop requirement: {0}")]
    InvalidAutostopRequirement(String),

    /// Feature requires the enterprise policy store
    #[error("{0} is not entitled on this deployment")]
    NotEntitled(&'static str),

    /// Quiet hours schedule failed validation
    #[error("invalid quiet hours schedule: {0}")]
    InvalidQuietHours(String),

    /// Quiet hours schedule failed to parse
    #[error("parse quiet hours schedule: {0}")]
    QuietHoursParse(#[from] CronError),

    /// Underlying datastore failure
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Autostop calculation errors
///
/// Every variant except `Policy` means an internal invariant was broken.
#[derive(Debug, Error)]
pub enum AutostopError {
    /// Wall clock is before the restart requirement epoch
    #[error("system clock is incorrect, cannot calculate template autostop requirement")]
    ClockBeforeEpoch,

    /// Week scan wrapped without hitting a permitted weekday
    #[error("could not find suitable day for template autostop requirement in the next 7 days")]
    NoSuitableDay,

    /// Quiet hours schedule produced no next occurrence
    #[error("could not find next occurrence of template autostop requirement in user quiet hours schedule")]
    NoQuietHoursOccurrence,

    /// Calculated deadline or max deadline ended up before now
    #[error(
        "deadline calculation error, computed deadline or max deadline is in the past: \
         deadline={deadline:?} max_deadline={max_deadline:?} now={now}"
    )]
    DeadlineInPast {
        deadline: Option<DateTime<Utc>>,
        max_deadline: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    },

    /// Could not resolve the policies the calculation depends on
    #[error("resolve schedule policy: {0}")]
    Policy(#[from] PolicyError),
}

/// Configuration error variants
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to load configuration file
    #[error("failed to load config {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Configuration parsing error
    #[error("failed to parse config: {reason}")]
    ParseError { reason: String },

    /// Invalid configuration value
    #[error("invalid config value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}
