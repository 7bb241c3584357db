//! Scheduling primitives and policies.
//!
//! - `cron` - constrained cron schedules and overlap checks
//! - `template` - template schedule policy and the baseline store
//! - `user_quiet_hours` - per-user quiet hours and the baseline store
//! - `enterprise` - policy stores that enforce every template and user setting
//! - `autostart` - next autostart on an allowed day
//! - `autostop` - deadline and max deadline calculation

pub mod autostart;
pub mod autostop;
pub mod cron;
pub mod enterprise;
pub mod template;
pub mod user_quiet_hours;

pub use autostart::{next_allowed_autostart, next_autostart};
pub use autostop::{
    calculate_autostop, compute_autostop, monday_of_week, weeks_since_epoch, AutostopTime,
    CalculateAutostopParams,
};
pub use cron::{schedules_overlap, Schedule};
pub use enterprise::{EnterpriseTemplateScheduleStore, EnterpriseUserQuietHoursScheduleStore};
pub use template::{
    weekday_bit, AutostartRequirement, AutostopRequirement, BaselineTemplateScheduleStore,
    TemplateSchedulePolicy, TemplateScheduleStore, ALL_DAYS,
};
pub use user_quiet_hours::{
    BaselineUserQuietHoursScheduleStore, UserQuietHoursSchedule, UserQuietHoursScheduleStore,
};
