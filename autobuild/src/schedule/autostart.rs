//! Next autostart occurrence, filtered by the template's allowed days.

use chrono::{DateTime, Datelike, Duration, Utc};

use super::cron::Schedule;
use super::template::TemplateSchedulePolicy;

/// Next occurrence of the workspace's weekly autostart schedule after `at`.
///
/// The second value tells whether the template allows autostart on that
/// day. The weekday is taken in the schedule's own timezone, so "Saturday"
/// means Saturday where the schedule lives.
pub fn next_autostart(
    at: DateTime<Utc>,
    raw_schedule: &str,
    policy: &TemplateSchedulePolicy,
) -> Option<(DateTime<Utc>, bool)> {
    let schedule = Schedule::weekly(raw_schedule).ok()?;
    let zoned = schedule.next(at)?;
    let allowed = policy.autostart_requirement.allows(zoned.weekday());
    Some((zoned.with_timezone(&Utc), allowed))
}

/// First autostart after `at` on an allowed day, searching up to a week.
pub fn next_allowed_autostart(
    at: DateTime<Utc>,
    raw_schedule: &str,
    policy: &TemplateSchedulePolicy,
) -> Option<DateTime<Utc>> {
    let horizon = at + Duration::days(7);
    let mut next = at;
    while next < horizon {
        let (candidate, allowed) = next_autostart(next, raw_schedule, policy)?;
        if allowed {
            return Some(candidate);
        }
        next = candidate;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::template::{weekday_bit, AutostartRequirement};
    use chrono::{TimeZone, Weekday};

    fn weekdays_only() -> TemplateSchedulePolicy {
        TemplateSchedulePolicy {
            autostart_requirement: AutostartRequirement {
                days_of_week: 0b0011_1110,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_next_autostart_reports_disallowed_day() {
        // Friday 2023-02-10 10:00 UTC, schedule fires every day at 09:00
        let at = Utc.with_ymd_and_hms(2023, 2, 10, 10, 0, 0).unwrap();
        let (next, allowed) = next_autostart(at, "0 9 * * *", &weekdays_only()).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2023, 2, 11, 9, 0, 0).unwrap());
        assert!(!allowed);
    }

    #[test]
    fn test_next_allowed_autostart_skips_weekend() {
        let at = Utc.with_ymd_and_hms(2023, 2, 10, 10, 0, 0).unwrap();
        let next = next_allowed_autostart(at, "0 9 * * *", &weekdays_only()).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2023, 2, 13, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_allowed_day_uses_schedule_timezone() {
        // 20:00 Friday in Chicago is 02:00 Saturday UTC
        let policy = TemplateSchedulePolicy {
            autostart_requirement: AutostartRequirement {
                days_of_week: weekday_bit(Weekday::Fri),
            },
            ..Default::default()
        };
        let at = Utc.with_ymd_and_hms(2024, 2, 16, 12, 0, 0).unwrap();
        let (next, allowed) = next_autostart(at, "CRON_TZ=America/Chicago 0 20 * * *", &policy).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 2, 17, 2, 0, 0).unwrap());
        assert!(allowed);
    }

    #[test]
    fn test_no_allowed_day_or_invalid_schedule() {
        let never = TemplateSchedulePolicy {
            autostart_requirement: AutostartRequirement { days_of_week: 0 },
            ..Default::default()
        };
        let at = Utc.with_ymd_and_hms(2023, 2, 10, 10, 0, 0).unwrap();
        assert_eq!(next_allowed_autostart(at, "0 9 * * *", &never), None);
        assert_eq!(next_autostart(at, "0 9 1 * *", &never), None);
    }
}
