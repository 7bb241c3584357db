//! Constrained 5-field cron schedules with an optional timezone prefix.
//!
//! Expressions have the form `[CRON_TZ=<zone>] minute hour dom month dow`.
//! Fields accept `*`, single values, `a-b` ranges, `/step` suffixes and comma
//! separated lists. Day of week runs 0 (Sunday) to 6 (Saturday).

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::fmt;

use crate::constants::cron::{MAX_SEARCH_DAYS, MIN_INTERVAL_WINDOW_HOURS};
use crate::errors::CronError;

const TZ_PREFIXES: [&str; 2] = ["CRON_TZ=", "TZ="];

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23 };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12 };
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 6 };

/// A parsed recurrence rule bound to a timezone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    location: Tz,
    fields: [String; 5],
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_star: bool,
    dow_star: bool,
}

impl Schedule {
    /// Parse a schedule that may vary only by minute, hour and day of week.
    pub fn weekly(raw: &str) -> Result<Self, CronError> {
        let schedule = Self::parse(raw)?;
        if schedule.fields[2] != "*" || schedule.fields[3] != "*" {
            return Err(CronError::NotWeekly(raw.to_string()));
        }
        Ok(schedule)
    }

    /// Parse a schedule that may vary only by minute and hour.
    pub fn daily(raw: &str) -> Result<Self, CronError> {
        let schedule = Self::parse(raw)?;
        if schedule.fields[2..].iter().any(|field| field != "*") {
            return Err(CronError::NotDaily(raw.to_string()));
        }
        Ok(schedule)
    }

    fn parse(raw: &str) -> Result<Self, CronError> {
        let (location, rest) = split_timezone(raw)?;
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount {
                raw: raw.to_string(),
                got: fields.len(),
            });
        }

        Ok(Self {
            location,
            minutes: parse_field(fields[0], MINUTE)?,
            hours: parse_field(fields[1], HOUR)?,
            days_of_month: parse_field(fields[2], DAY_OF_MONTH)?,
            months: parse_field(fields[3], MONTH)?,
            days_of_week: parse_field(fields[4], DAY_OF_WEEK)?,
            dom_star: is_star(fields[2]),
            dow_star: is_star(fields[4]),
            fields: [
                fields[0].to_string(),
                fields[1].to_string(),
                fields[2].to_string(),
                fields[3].to_string(),
                fields[4].to_string(),
            ],
        })
    }

    pub fn location(&self) -> Tz {
        self.location
    }

    /// Hour and minute when the schedule names exactly one time of day.
    pub fn time_of_day(&self) -> Option<(u32, u32)> {
        if self.hours.count_ones() != 1 || self.minutes.count_ones() != 1 {
            return None;
        }
        Some((self.hours.trailing_zeros(), self.minutes.trailing_zeros()))
    }

    /// The first occurrence strictly after `after`, in the schedule's zone.
    ///
    /// Wall-clock times skipped by a DST gap do not occur; repeated wall-clock
    /// times resolve to their first instance.
    pub fn next(&self, after: DateTime<Utc>) -> Option<DateTime<Tz>> {
        let local = after.with_timezone(&self.location);
        let first_day = local.date_naive();
        let mut date = first_day;

        for _ in 0..MAX_SEARCH_DAYS {
            if self.matches_day(date) {
                for hour in bits(self.hours) {
                    if date == first_day && hour < local.hour() {
                        continue;
                    }
                    for minute in bits(self.minutes) {
                        if date == first_day && hour == local.hour() && minute < local.minute() {
                            continue;
                        }
                        let Some(naive) = date.and_hms_opt(hour, minute, 0) else {
                            continue;
                        };
                        let Some(candidate) = resolve_local(&self.location, &naive) else {
                            continue;
                        };
                        if candidate.with_timezone(&Utc) > after {
                            return Some(candidate);
                        }
                    }
                }
            }
            date = date.succ_opt()?;
        }
        None
    }

    /// Smallest gap between consecutive occurrences over one week.
    pub fn min(&self) -> Duration {
        let window = Duration::hours(MIN_INTERVAL_WINDOW_HOURS);
        let start = reference_week_start(self.location);
        let end = start + window;

        let Some(mut previous) = self.next(start - Duration::minutes(1)) else {
            return window;
        };
        let mut shortest = window;
        while previous.with_timezone(&Utc) < end {
            let Some(current) = self.next(previous.with_timezone(&Utc)) else {
                break;
            };
            let gap = current.signed_duration_since(previous);
            if gap < shortest {
                shortest = gap;
            }
            previous = current;
        }
        shortest
    }

    fn matches_day(&self, date: NaiveDate) -> bool {
        if !has_bit(self.months, date.month()) {
            return false;
        }
        self.day_rule()
            .matches(date.day(), date.weekday().num_days_from_sunday())
    }

    fn day_rule(&self) -> DayRule {
        DayRule {
            days_of_month: self.days_of_month,
            days_of_week: self.days_of_week,
            dom_star: self.dom_star,
            dow_star: self.dow_star,
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CRON_TZ={} {}", self.location.name(), self.fields.join(" "))
    }
}

/// Whether two schedules can fire in the same hour of the same day.
///
/// Minutes and timezones are not compared.
pub fn schedules_overlap(a: &str, b: &str) -> Result<bool, CronError> {
    let a = split_fields(a)?;
    let b = split_fields(b)?;

    let intersects = |index: usize, spec: FieldSpec| -> Result<bool, CronError> {
        Ok(parse_field(a[index], spec)? & parse_field(b[index], spec)? != 0)
    };

    let months = intersects(3, MONTH)?;
    let hours = intersects(1, HOUR)?;
    let a_days = DayRule::parse(&a)?;
    let b_days = DayRule::parse(&b)?;
    // Every day of the month falls on every weekday in some month.
    let days = (DAY_OF_MONTH.min..=DAY_OF_MONTH.max).any(|day| {
        (DAY_OF_WEEK.min..=DAY_OF_WEEK.max)
            .any(|weekday| a_days.matches(day, weekday) && b_days.matches(day, weekday))
    });
    Ok(months && days && hours)
}

/// Day-of-month and day-of-week matching with the usual cron rule: when
/// either field is a star both must match, otherwise either may.
struct DayRule {
    days_of_month: u64,
    days_of_week: u64,
    dom_star: bool,
    dow_star: bool,
}

impl DayRule {
    fn parse(fields: &[&str]) -> Result<Self, CronError> {
        Ok(Self {
            days_of_month: parse_field(fields[2], DAY_OF_MONTH)?,
            days_of_week: parse_field(fields[4], DAY_OF_WEEK)?,
            dom_star: is_star(fields[2]),
            dow_star: is_star(fields[4]),
        })
    }

    fn matches(&self, day: u32, weekday: u32) -> bool {
        let dom = has_bit(self.days_of_month, day);
        let dow = has_bit(self.days_of_week, weekday);
        if self.dom_star || self.dow_star {
            dom && dow
        } else {
            dom || dow
        }
    }
}

fn split_fields(raw: &str) -> Result<Vec<&str>, CronError> {
    let (_, rest) = split_timezone(raw)?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(CronError::FieldCount {
            raw: raw.to_string(),
            got: fields.len(),
        });
    }
    Ok(fields)
}

fn split_timezone(raw: &str) -> Result<(Tz, &str), CronError> {
    let trimmed = raw.trim();
    for prefix in TZ_PREFIXES {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            let (name, fields) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            if name.eq_ignore_ascii_case("local") {
                return Err(CronError::LocalTimezone);
            }
            let location = name
                .parse::<Tz>()
                .map_err(|_| CronError::UnknownTimezone(name.to_string()))?;
            return Ok((location, fields));
        }
    }
    Ok((Tz::UTC, trimmed))
}

fn is_star(field: &str) -> bool {
    field == "*" || field == "?"
}

fn parse_field(field: &str, spec: FieldSpec) -> Result<u64, CronError> {
    let invalid = |reason: String| CronError::InvalidField {
        field: spec.name,
        value: field.to_string(),
        reason,
    };

    if field.is_empty() {
        return Err(invalid("empty field".to_string()));
    }

    let mut mask = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(format!("step {step:?} is not a number")))?;
                if step == 0 {
                    return Err(invalid("step must be greater than zero".to_string()));
                }
                if step > spec.max {
                    return Err(invalid(format!("step {step} exceeds {}", spec.max)));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" || range == "?" {
            (spec.min, spec.max)
        } else if let Some((low, high)) = range.split_once('-') {
            (parse_value(low, spec, &invalid)?, parse_value(high, spec, &invalid)?)
        } else {
            let value = parse_value(range, spec, &invalid)?;
            // `5/15` means every 15 starting at 5
            if step.is_some() {
                (value, spec.max)
            } else {
                (value, value)
            }
        };

        if start > end {
            return Err(invalid(format!("range {start}-{end} is inverted")));
        }

        let step = step.unwrap_or(1);
        let mut value = start;
        while value <= end {
            mask |= 1 << value;
            value += step;
        }
    }
    Ok(mask)
}

fn parse_value(
    text: &str,
    spec: FieldSpec,
    invalid: &dyn Fn(String) -> CronError,
) -> Result<u32, CronError> {
    let value: u32 = text
        .parse()
        .map_err(|_| invalid(format!("{text:?} is not a number")))?;
    if value < spec.min || value > spec.max {
        return Err(invalid(format!(
            "{value} is outside {}-{}",
            spec.min, spec.max
        )));
    }
    Ok(value)
}

fn has_bit(mask: u64, bit: u32) -> bool {
    mask & (1 << bit) != 0
}

fn bits(mask: u64) -> impl Iterator<Item = u32> {
    (0..64u32).filter(move |bit| has_bit(mask, *bit))
}

/// Resolve a wall-clock time, taking the earlier instant when it is repeated.
pub(crate) fn resolve_local(location: &Tz, naive: &NaiveDateTime) -> Option<DateTime<Tz>> {
    match location.from_local_datetime(naive) {
        LocalResult::Single(time) => Some(time),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => None,
    }
}

fn reference_week_start(location: Tz) -> DateTime<Utc> {
    // Monday 2023-01-02. No zone changes offset during that week.
    let naive = NaiveDate::from_ymd_opt(2023, 1, 2)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .unwrap_or_default();
    resolve_local(&location, &naive)
        .map(|time| time.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;
    use test_case::test_case;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_weekly_defaults_to_utc() {
        let schedule = Schedule::weekly("30 9 * * 1-5").unwrap();
        assert_eq!(schedule.location(), Tz::UTC);
        assert_eq!(schedule.to_string(), "CRON_TZ=UTC 30 9 * * 1-5");
    }

    #[test]
    fn test_weekly_next_skips_weekend() {
        let schedule = Schedule::weekly("CRON_TZ=UTC 30 9 * * 1-5").unwrap();
        // Friday 2023-02-10 after 09:30 -> Monday 2023-02-13 09:30
        let next = schedule.next(utc(2023, 2, 10, 10, 0)).unwrap();
        assert_eq!(next.with_timezone(&Utc), utc(2023, 2, 13, 9, 30));
        assert_eq!(next.weekday(), Weekday::Mon);
    }

    #[test]
    fn test_next_is_strictly_after() {
        let schedule = Schedule::daily("CRON_TZ=UTC 0 8 * * *").unwrap();
        let at = utc(2023, 2, 10, 8, 0);
        assert_eq!(schedule.next(at).unwrap().with_timezone(&Utc), utc(2023, 2, 11, 8, 0));
        let just_before = at - Duration::seconds(1);
        assert_eq!(schedule.next(just_before).unwrap().with_timezone(&Utc), at);
    }

    #[test]
    fn test_next_in_schedule_timezone() {
        // 20:00 in Chicago (CST, UTC-6) is 02:00 UTC the next day
        let schedule = Schedule::weekly("CRON_TZ=America/Chicago 0 20 * * *").unwrap();
        let next = schedule.next(utc(2024, 2, 14, 12, 0)).unwrap();
        assert_eq!(next.with_timezone(&Utc), utc(2024, 2, 15, 2, 0));
        assert_eq!(next.hour(), 20);
    }

    #[test]
    fn test_next_skips_dst_gap() {
        // Sydney jumps from 02:00 to 03:00 on 2023-10-01
        let schedule = Schedule::daily("CRON_TZ=Australia/Sydney 30 2 * * *").unwrap();
        let before = Tz::Australia__Sydney
            .with_ymd_and_hms(2023, 9, 30, 12, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let next = schedule.next(before).unwrap();
        assert_eq!(next.date_naive(), NaiveDate::from_ymd_opt(2023, 10, 2).unwrap());
        assert_eq!((next.hour(), next.minute()), (2, 30));
    }

    #[test]
    fn test_next_takes_first_of_repeated_time() {
        // Sydney falls back from 03:00 to 02:00 on 2024-04-07
        let schedule = Schedule::daily("CRON_TZ=Australia/Sydney 30 2 * * *").unwrap();
        let before = Tz::Australia__Sydney
            .with_ymd_and_hms(2024, 4, 6, 12, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let next = schedule.next(before).unwrap();
        // First 02:30 is still daylight time (UTC+11)
        assert_eq!(next.with_timezone(&Utc), utc(2024, 4, 6, 15, 30));
    }

    #[test]
    fn test_time_of_day() {
        assert_eq!(Schedule::daily("CRON_TZ=Europe/London 30 22 * * *").unwrap().time_of_day(), Some((22, 30)));
        assert_eq!(Schedule::daily("0 0,12 * * *").unwrap().time_of_day(), None);
    }

    #[test]
    fn test_min_interval() {
        assert_eq!(Schedule::daily("0 0 * * *").unwrap().min(), Duration::hours(24));
        assert_eq!(Schedule::weekly("0 9 * * 1").unwrap().min(), Duration::hours(168));
        assert_eq!(Schedule::weekly("0 9,17 * * 1-5").unwrap().min(), Duration::hours(8));
        assert_eq!(Schedule::weekly("*/15 * * * *").unwrap().min(), Duration::minutes(15));
    }

    #[test]
    fn test_round_trip_preserves_occurrences() {
        let inputs = [
            "CRON_TZ=Europe/Berlin 15 7 * * 1,3,5",
            "0 */6 * * 0-6",
            "TZ=America/New_York 45 23 * * 6",
        ];
        let probes = [utc(2023, 3, 1, 0, 0), utc(2023, 11, 5, 5, 30), utc(2024, 6, 30, 23, 59)];
        for input in inputs {
            let parsed = Schedule::weekly(input).unwrap();
            let reparsed = Schedule::weekly(&parsed.to_string()).unwrap();
            for probe in probes {
                assert_eq!(parsed.next(probe), reparsed.next(probe), "{input}");
            }
        }
    }

    #[test_case("0 9 * *" ; "too few fields")]
    #[test_case("0 9 * * * *" ; "too many fields")]
    #[test_case("60 9 * * *" ; "minute out of range")]
    #[test_case("0 24 * * *" ; "hour out of range")]
    #[test_case("0 9 * * 7" ; "day of week out of range")]
    #[test_case("0 17-9 * * *" ; "inverted range")]
    #[test_case("*/0 9 * * *" ; "zero step")]
    #[test_case("1/4294967295 9 * * *" ; "step past u32 range")]
    #[test_case("0 */24 * * *" ; "step wider than field")]
    #[test_case("0 9 1 * *" ; "day of month set")]
    #[test_case("0 9 * 2 *" ; "month set")]
    #[test_case("CRON_TZ=Local 0 9 * * *" ; "local timezone")]
    #[test_case("CRON_TZ=Mars/Olympus 0 9 * * *" ; "unknown timezone")]
    fn test_weekly_rejects(raw: &str) {
        assert!(Schedule::weekly(raw).is_err());
    }

    #[test]
    fn test_daily_rejects_day_of_week() {
        assert_eq!(
            Schedule::daily("0 0 * * 1"),
            Err(CronError::NotDaily("0 0 * * 1".to_string()))
        );
    }

    #[test]
    fn test_local_timezone_error_variant() {
        assert_eq!(Schedule::daily("CRON_TZ=Local 0 0 * * *"), Err(CronError::LocalTimezone));
    }

    #[test]
    fn test_schedules_overlap() {
        assert!(schedules_overlap("0 9 * * 1-5", "30 9 * * 5").unwrap());
        assert!(!schedules_overlap("0 9 * * 1-5", "0 9 * * 0,6").unwrap());
        assert!(!schedules_overlap("0 9 * * *", "0 10 * * *").unwrap());
        assert!(!schedules_overlap("0 9 * 1-6 *", "0 9 * 7-12 *").unwrap());
        // Day of month or day of week intersection is enough
        assert!(schedules_overlap("0 9 1 * 1", "0 9 1 * 2").unwrap());
    }

    #[test]
    fn test_huge_step_is_invalid_field() {
        assert!(matches!(
            Schedule::weekly("1/4294967295 9 * * *"),
            Err(CronError::InvalidField { field: "minute", .. })
        ));
        assert_eq!(Schedule::weekly("5/59 9 * * *").unwrap().time_of_day(), Some((9, 5)));
    }

    #[test]
    fn test_stepped_day_of_month_is_not_a_star() {
        // Odd days or Mondays, against Tuesdays: the 1st can be a Tuesday.
        assert!(schedules_overlap("0 9 */2 * 1", "0 9 * * 2").unwrap());
        assert!(!schedules_overlap("0 9 * * 1", "0 9 * * 2").unwrap());
        assert!(is_star("*") && is_star("?"));
        assert!(!is_star("*/2"));
    }

    #[test]
    fn test_schedules_overlap_rejects_malformed() {
        assert!(schedules_overlap("0 25 * * *", "0 9 * * *").is_err());
        assert!(schedules_overlap("0 9 * 12-1 *", "0 9 * * *").is_err());
        assert!(schedules_overlap("0 9 32 * *", "0 9 * * *").is_err());
    }
}
