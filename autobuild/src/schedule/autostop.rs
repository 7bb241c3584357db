//! Autostop deadline calculation.
//!
//! A start build gets two stop times:
//! - `deadline`, the soft stop derived from the TTL, which activity may bump
//! - `max_deadline`, the compliance ceiling derived from the template's
//!   autostop requirement and the owner's quiet hours, never bumped
//!
//! When both are set the deadline never exceeds the max deadline.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use tracing::debug;

use super::autostart::next_autostart;
use super::cron::{resolve_local, Schedule};
use super::template::{AutostopRequirement, TemplateScheduleStore, TemplateSchedulePolicy};
use super::user_quiet_hours::UserQuietHoursScheduleStore;
use crate::constants::autostop::{MIN_STOP_OFFSET_HOURS, REQUIREMENT_BUFFER_MINUTES, REQUIREMENT_LEEWAY_HOURS};
use crate::database::{StoreTx, Workspace};
use crate::errors::AutostopError;

/// One full week plus a guard iteration
const DAY_SCAN_LIMIT: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AutostopTime {
    pub deadline: Option<DateTime<Utc>>,
    pub max_deadline: Option<DateTime<Utc>>,
}

pub struct CalculateAutostopParams<'a> {
    pub template_schedule_store: &'a dyn TemplateScheduleStore,
    pub user_quiet_hours_store: &'a dyn UserQuietHoursScheduleStore,
    pub now: DateTime<Utc>,
    pub workspace: &'a Workspace,
}

/// Resolve the workspace's policies and compute its autostop times.
pub async fn calculate_autostop(
    tx: &mut dyn StoreTx,
    params: CalculateAutostopParams<'_>,
) -> Result<AutostopTime, AutostopError> {
    let workspace = params.workspace;
    let policy = params
        .template_schedule_store
        .get(tx, workspace.template_id)
        .await?;

    // Quiet hours only matter when the template enforces restarts.
    let quiet_hours = if policy.autostop_requirement.is_enabled() {
        params
            .user_quiet_hours_store
            .get(tx, workspace.owner_id)
            .await?
            .schedule
    } else {
        None
    };

    compute_autostop(
        &policy,
        quiet_hours.as_ref(),
        params.now,
        workspace.ttl(),
        workspace.autostart_schedule.as_deref(),
    )
}

/// Compute autostop times from already resolved inputs.
pub fn compute_autostop(
    policy: &TemplateSchedulePolicy,
    quiet_hours: Option<&Schedule>,
    now: DateTime<Utc>,
    workspace_ttl: Option<Duration>,
    workspace_autostart: Option<&str>,
) -> Result<AutostopTime, AutostopError> {
    let mut autostop = AutostopTime::default();

    let ttl = if policy.user_autostop_enabled {
        workspace_ttl.unwrap_or_else(Duration::zero)
    } else {
        policy.default_ttl
    };

    if ttl > Duration::zero() {
        let mut deadline = now + ttl;
        // A workspace that autostarts before its deadline keeps running for
        // a full TTL after that autostart.
        if let Some(raw) = workspace_autostart.filter(|raw| !raw.is_empty()) {
            if let Some((next_start, true)) = next_autostart(now, raw, policy) {
                if deadline > next_start {
                    deadline = next_start + ttl;
                }
            }
        }
        autostop.deadline = Some(deadline);
    }

    if policy.autostop_requirement.is_enabled() {
        match quiet_hours {
            Some(schedule) => {
                autostop.max_deadline =
                    Some(requirement_max_deadline(policy.autostop_requirement, schedule, now)?);
            }
            None => debug!("No quiet hours schedule, skipping max deadline"),
        }
    }

    if let Some(max_deadline) = autostop.max_deadline {
        if autostop.deadline.map_or(true, |deadline| max_deadline < deadline) {
            autostop.deadline = Some(max_deadline);
        }
    }

    let before_now = |time: Option<DateTime<Utc>>| time.is_some_and(|time| time < now);
    if before_now(autostop.deadline) || before_now(autostop.max_deadline) {
        return Err(AutostopError::DeadlineInPast {
            deadline: autostop.deadline,
            max_deadline: autostop.max_deadline,
            now,
        });
    }

    Ok(autostop)
}

fn requirement_max_deadline(
    requirement: AutostopRequirement,
    quiet_hours: &Schedule,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, AutostopError> {
    let location = quiet_hours.location();
    let leeway = Duration::hours(REQUIREMENT_LEEWAY_HOURS);
    let buffer = Duration::minutes(REQUIREMENT_BUFFER_MINUTES);

    let mut stop_day = truncate_midnight((now + leeway).with_timezone(&location));

    if requirement.weeks > 1 {
        let weeks = weeks_since_epoch(stop_day)?;
        let remainder = weeks % requirement.weeks;
        if remainder != 0 {
            stop_day = monday_of_week(location, weeks + requirement.weeks - remainder)?;
        }
    }

    // Today's quiet hours are too close or already gone.
    let first_stop = quiet_hours
        .next((stop_day - buffer).with_timezone(&Utc))
        .ok_or(AutostopError::NoQuietHoursOccurrence)?;
    if first_stop < now + leeway {
        stop_day = next_day_midnight(stop_day);
    }

    for scanned in 0..DAY_SCAN_LIMIT {
        if scanned == DAY_SCAN_LIMIT - 1 {
            return Err(AutostopError::NoSuitableDay);
        }
        if requirement.allows(stop_day.weekday()) {
            break;
        }
        stop_day = next_day_midnight(stop_day);
    }

    let min_offset = now + Duration::hours(MIN_STOP_OFFSET_HOURS);
    let check_from = if stop_day < min_offset {
        min_offset
    } else {
        (stop_day - buffer).with_timezone(&Utc)
    };

    quiet_hours
        .next(check_from)
        .map(|time| time.with_timezone(&Utc))
        .ok_or(AutostopError::NoQuietHoursOccurrence)
}

/// Monday 2023-01-02 at midnight in `location`, the start of week zero.
pub fn autostop_requirement_epoch(location: Tz) -> DateTime<Tz> {
    midnight_of(epoch_date(), location)
}

/// Whole weeks between the epoch and `at`, counted in calendar days so DST
/// shifts cannot move a week boundary.
pub fn weeks_since_epoch(at: DateTime<Tz>) -> Result<i64, AutostopError> {
    let epoch = autostop_requirement_epoch(at.timezone());
    if at < epoch {
        return Err(AutostopError::ClockBeforeEpoch);
    }

    let mut days: i64 = 0;
    for year in epoch.year()..at.year() {
        days += NaiveDate::from_ymd_opt(year, 12, 31)
            .map(|last| i64::from(last.ordinal()))
            .unwrap_or(365);
    }
    days += i64::from(at.ordinal()) - i64::from(epoch.ordinal());
    Ok(days / 7)
}

/// Midnight of the Monday starting week `week` after the epoch.
pub fn monday_of_week(location: Tz, week: i64) -> Result<DateTime<Tz>, AutostopError> {
    let offset = u64::try_from(week)
        .ok()
        .and_then(|week| week.checked_mul(7))
        .ok_or(AutostopError::ClockBeforeEpoch)?;
    let date = epoch_date()
        .checked_add_days(chrono::Days::new(offset))
        .ok_or(AutostopError::NoSuitableDay)?;
    let monday = midnight_of(date, location);
    if monday.weekday() != Weekday::Mon {
        return Err(AutostopError::NoSuitableDay);
    }
    Ok(monday)
}

fn epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 1, 2).unwrap_or_default()
}

fn truncate_midnight(at: DateTime<Tz>) -> DateTime<Tz> {
    midnight_of(at.date_naive(), at.timezone())
}

fn next_day_midnight(at: DateTime<Tz>) -> DateTime<Tz> {
    let date = at.date_naive();
    midnight_of(date.succ_opt().unwrap_or(date), at.timezone())
}

/// First instant of `date` in `location`. Zones whose DST change happens at
/// midnight start that day at the end of the gap.
fn midnight_of(date: NaiveDate, location: Tz) -> DateTime<Tz> {
    let midnight = date.and_time(chrono::NaiveTime::MIN);
    (0..=4)
        .map(|half_hours| midnight + Duration::minutes(30 * half_hours))
        .find_map(|naive| resolve_local(&location, &naive))
        .unwrap_or_else(|| location.from_utc_datetime(&midnight))
}
