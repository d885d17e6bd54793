use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Timelike, Utc};
use cron::Schedule;
use std::collections::BTreeSet;
use std::str::FromStr;
use thiserror::Error;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];
// day-of-week spelling understood by the schedule engine, indexed from Sunday
const ENGINE_DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),

    #[error("invalid {field} field: {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("{field} value {value} outside {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("unsupported schedule {expression:?}: {message}")]
    Engine { expression: String, message: String },
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// First value the names map to.
    names_base: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
    names_base: 0,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
    names_base: 0,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    names_base: 0,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &MONTH_NAMES,
    names_base: 1,
};
// 7 is accepted as an alias for Sunday and folded onto 0
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &DAY_NAMES,
    names_base: 0,
};

/// A standard 5-field cron expression (minute hour day-of-month month
/// day-of-week) evaluated in UTC with POSIX semantics.
///
/// Fields are validated and expanded here, then handed to the `cron` crate,
/// which wants a seconds field and counts weekdays from 1. When both day
/// fields are restricted a day matches if either matches: that case keeps
/// two schedules and takes the nearest run of either.
#[derive(Debug, Clone)]
pub struct CronExpression {
    source: String,
    schedules: Vec<Schedule>,
}

fn invalid(spec: &FieldSpec, value: &str) -> CronError {
    CronError::InvalidField {
        field: spec.name,
        value: value.to_string(),
    }
}

fn parse_value(spec: &FieldSpec, raw: &str) -> Result<u32, CronError> {
    let value = match raw.parse::<u32>() {
        Ok(v) => v,
        Err(_) => {
            let upper = raw.to_ascii_uppercase();
            let pos = spec
                .names
                .iter()
                .position(|n| *n == upper)
                .ok_or_else(|| invalid(spec, raw))?;
            pos as u32 + spec.names_base
        }
    };
    if value < spec.min || value > spec.max {
        return Err(CronError::OutOfRange {
            field: spec.name,
            value,
            min: spec.min,
            max: spec.max,
        });
    }
    Ok(value)
}

/// Parse a step. It must fit the field's span, so "1/4294967295" is refused.
fn parse_step(spec: &FieldSpec, item: &str, raw: &str) -> Result<u32, CronError> {
    let step: u32 = raw.parse().map_err(|_| invalid(spec, item))?;
    let span = spec.max - spec.min;
    if step == 0 || step > span.max(1) {
        return Err(CronError::OutOfRange {
            field: spec.name,
            value: step,
            min: 1,
            max: span.max(1),
        });
    }
    Ok(step)
}

/// Expand one field into the set of values it allows.
fn expand_field(spec: &FieldSpec, text: &str) -> Result<BTreeSet<u32>, CronError> {
    let mut values = BTreeSet::new();
    for item in text.split(',') {
        if item.is_empty() {
            return Err(invalid(spec, text));
        }
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, parse_step(spec, item, step)?),
            None => (item, 1),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            let lo = parse_value(spec, lo)?;
            let hi = parse_value(spec, hi)?;
            if lo > hi {
                return Err(invalid(spec, item));
            }
            (lo, hi)
        } else {
            let start = parse_value(spec, range)?;
            // "5/15" runs from 5 to the end of the range
            if item.contains('/') {
                (start, spec.max)
            } else {
                (start, start)
            }
        };

        values.extend((start..=end).step_by(step as usize));
    }
    Ok(values)
}

fn render_numbers(text: &str, values: &BTreeSet<u32>) -> String {
    if text == "*" {
        return "*".to_string();
    }
    values
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn render_weekdays(text: &str, values: &BTreeSet<u32>) -> String {
    if text == "*" {
        return "*".to_string();
    }
    let days: BTreeSet<usize> = values.iter().map(|d| (*d % 7) as usize).collect();
    days.into_iter()
        .map(|d| ENGINE_DAY_NAMES[d])
        .collect::<Vec<_>>()
        .join(",")
}

fn build_schedule(source: &str, fields: [&str; 5]) -> Result<Schedule, CronError> {
    let [minute, hour, dom, month, dow] = fields;
    let engine = format!("0 {minute} {hour} {dom} {month} {dow}");
    Schedule::from_str(&engine).map_err(|e| CronError::Engine {
        expression: source.to_string(),
        message: e.to_string(),
    })
}

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields[..] else {
            return Err(CronError::FieldCount(fields.len()));
        };
        let source = fields.join(" ");

        let minute = render_numbers(minute, &expand_field(&MINUTE, minute)?);
        let hour = render_numbers(hour, &expand_field(&HOUR, hour)?);
        let dom_values = render_numbers(dom, &expand_field(&DAY_OF_MONTH, dom)?);
        let month = render_numbers(month, &expand_field(&MONTH, month)?);
        let dow_values = render_weekdays(dow, &expand_field(&DAY_OF_WEEK, dow)?);

        let dom_restricted = !dom.starts_with('*');
        let dow_restricted = !dow.starts_with('*');
        let schedules = if dom_restricted && dow_restricted {
            vec![
                build_schedule(
                    &source,
                    [minute.as_str(), hour.as_str(), dom_values.as_str(), month.as_str(), "*"],
                )?,
                build_schedule(
                    &source,
                    [minute.as_str(), hour.as_str(), "*", month.as_str(), dow_values.as_str()],
                )?,
            ]
        } else {
            vec![build_schedule(
                &source,
                [
                    minute.as_str(),
                    hour.as_str(),
                    dom_values.as_str(),
                    month.as_str(),
                    dow_values.as_str(),
                ],
            )?]
        };

        Ok(Self { source, schedules })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the minute containing `t` is a scheduled minute.
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        let minute = truncate_to_minute(t.naive_utc()).and_utc();
        let just_before = minute - ChronoDuration::seconds(1);
        self.schedules
            .iter()
            .any(|s| s.after(&just_before).next() == Some(minute))
    }

    /// First scheduled minute strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|s| s.after(&now).next())
            .min()
    }

    /// Last scheduled minute strictly before `now`.
    pub fn previous_before(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|s| s.after(&now).next_back())
            .filter(|t| *t < now)
            .max()
    }
}

impl PartialEq for CronExpression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for CronExpression {}

impl FromStr for CronExpression {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for CronExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

pub(crate) fn truncate_to_minute(t: NaiveDateTime) -> NaiveDateTime {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::Rng;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_every_five_minutes_next() {
        let expr = CronExpression::parse("*/5 * * * *").unwrap();
        let now = at(2024, 3, 1, 10, 7, 30);
        let next = expr.next_after(now).unwrap();
        assert_eq!(next, at(2024, 3, 1, 10, 10, 0));
        assert!(next > now);
        assert_eq!(next.minute() % 5, 0);

        // exactly on a boundary still moves forward
        let on_boundary = at(2024, 3, 1, 10, 10, 0);
        assert_eq!(expr.next_after(on_boundary).unwrap(), at(2024, 3, 1, 10, 15, 0));
    }

    #[test]
    fn test_previous_is_strictly_before() {
        let expr = CronExpression::parse("*/5 * * * *").unwrap();
        assert_eq!(
            expr.previous_before(at(2024, 3, 1, 10, 10, 0)).unwrap(),
            at(2024, 3, 1, 10, 5, 0)
        );
        assert_eq!(
            expr.previous_before(at(2024, 3, 1, 10, 10, 1)).unwrap(),
            at(2024, 3, 1, 10, 10, 0)
        );
    }

    #[test]
    fn test_daily_and_rollover() {
        let expr = CronExpression::parse("30 3 * * *").unwrap();
        assert_eq!(
            expr.next_after(at(2024, 12, 31, 4, 0, 0)).unwrap(),
            at(2025, 1, 1, 3, 30, 0)
        );
        assert_eq!(
            expr.previous_before(at(2025, 1, 1, 3, 0, 0)).unwrap(),
            at(2024, 12, 31, 3, 30, 0)
        );
    }

    #[test]
    fn test_weekly_sunday_and_seven_alias() {
        // 2024-03-03 is a Sunday
        let sunday = CronExpression::parse("0 6 * * 0").unwrap();
        let seven = CronExpression::parse("0 6 * * 7").unwrap();
        let named = CronExpression::parse("0 6 * * sun").unwrap();
        let now = at(2024, 3, 1, 12, 0, 0);
        let expected = at(2024, 3, 3, 6, 0, 0);
        assert_eq!(sunday.next_after(now).unwrap(), expected);
        assert_eq!(seven.next_after(now).unwrap(), expected);
        assert_eq!(named.next_after(now).unwrap(), expected);
    }

    #[test]
    fn test_weekday_numbers_count_from_sunday() {
        // 1 is Monday: 2024-03-04
        let monday = CronExpression::parse("0 9 * * 1").unwrap();
        assert_eq!(
            monday.next_after(at(2024, 3, 1, 12, 0, 0)).unwrap(),
            at(2024, 3, 4, 9, 0, 0)
        );
        // 6 is Saturday: 2024-03-02
        let saturday = CronExpression::parse("0 9 * * 6").unwrap();
        assert_eq!(
            saturday.next_after(at(2024, 3, 1, 12, 0, 0)).unwrap(),
            at(2024, 3, 2, 9, 0, 0)
        );
        // a range crossing the Sunday alias
        let weekend = CronExpression::parse("0 9 * * 6-7").unwrap();
        assert!(weekend.matches(at(2024, 3, 2, 9, 0, 0)));
        assert!(weekend.matches(at(2024, 3, 3, 9, 0, 0)));
        assert!(!weekend.matches(at(2024, 3, 4, 9, 0, 0)));
    }

    #[test]
    fn test_monthly_first() {
        let expr = CronExpression::parse("0 0 1 * *").unwrap();
        assert_eq!(
            expr.next_after(at(2024, 2, 15, 0, 0, 0)).unwrap(),
            at(2024, 3, 1, 0, 0, 0)
        );
        assert_eq!(
            expr.previous_before(at(2024, 2, 15, 0, 0, 0)).unwrap(),
            at(2024, 2, 1, 0, 0, 0)
        );
    }

    #[test]
    fn test_day_of_month_or_day_of_week() {
        // the 13th, or any Friday
        let expr = CronExpression::parse("0 12 13 * 5").unwrap();
        // 2024-03-08 is a Friday, before the 13th
        assert_eq!(
            expr.next_after(at(2024, 3, 7, 0, 0, 0)).unwrap(),
            at(2024, 3, 8, 12, 0, 0)
        );
        assert_eq!(
            expr.next_after(at(2024, 3, 12, 0, 0, 0)).unwrap(),
            at(2024, 3, 13, 12, 0, 0)
        );
        assert_eq!(
            expr.previous_before(at(2024, 3, 12, 0, 0, 0)).unwrap(),
            at(2024, 3, 8, 12, 0, 0)
        );
        assert!(expr.matches(at(2024, 3, 13, 12, 0, 0)));
        assert!(expr.matches(at(2024, 3, 15, 12, 0, 0)));
        assert!(!expr.matches(at(2024, 3, 14, 12, 0, 0)));
    }

    #[test]
    fn test_leap_day() {
        let expr = CronExpression::parse("0 0 29 2 *").unwrap();
        assert_eq!(
            expr.next_after(at(2024, 3, 1, 0, 0, 0)).unwrap(),
            at(2028, 2, 29, 0, 0, 0)
        );
    }

    #[test]
    fn test_never_matching_date() {
        let expr = CronExpression::parse("0 0 31 2 *").unwrap();
        let now = at(2024, 1, 1, 0, 0, 0);
        assert_eq!(expr.next_after(now), None);
        assert_eq!(expr.previous_before(now), None);
    }

    #[test]
    fn test_lists_ranges_steps_and_names() {
        let expr = CronExpression::parse("0,30 9-17/4 * jan-mar MON-FRI").unwrap();
        // 2024-01-06 is a Saturday
        assert!(!expr.matches(at(2024, 1, 6, 9, 0, 0)));
        assert!(expr.matches(at(2024, 1, 8, 13, 30, 0)));
        assert!(!expr.matches(at(2024, 1, 8, 11, 0, 0)));
        assert!(!expr.matches(at(2024, 4, 8, 9, 0, 0)));
        assert!(expr.matches(at(2024, 3, 8, 17, 0, 59)));
    }

    #[test]
    fn test_rejects_malformed() {
        assert_eq!(
            CronExpression::parse("not a cron"),
            Err(CronError::FieldCount(3))
        );
        assert!(matches!(
            CronExpression::parse("60 * * * *"),
            Err(CronError::OutOfRange { value: 60, .. })
        ));
        assert!(CronExpression::parse("*/0 * * * *").is_err());
        assert!(CronExpression::parse("5-1 * * * *").is_err());
        assert!(CronExpression::parse("1,,2 * * * *").is_err());
        assert!(CronExpression::parse("* * * foo *").is_err());
        assert!(CronExpression::parse("* * 0 * *").is_err());
    }

    #[test]
    fn test_huge_steps_are_rejected() {
        assert!(matches!(
            CronExpression::parse("1/4294967295 * * * *"),
            Err(CronError::OutOfRange { field: "minute", .. })
        ));
        assert!(CronExpression::parse("* */4294967295 * * *").is_err());
        assert!(CronExpression::parse("* * * * 0-7/4294967295").is_err());
        assert!(CronExpression::parse("*/60 * * * *").is_err());
        // the widest step that still fits the field
        let expr = CronExpression::parse("*/59 * * * *").unwrap();
        assert!(expr.matches(at(2024, 3, 1, 10, 0, 0)));
        assert!(expr.matches(at(2024, 3, 1, 10, 59, 0)));
        assert!(!expr.matches(at(2024, 3, 1, 10, 1, 0)));
    }

    #[test]
    fn test_random_input_never_panics() {
        let tokens = [
            "*", "*/", "/", "-", ",", "0", "7", "59", "60", "99", "4294967295", "4294967296",
            "-1", "sun", "SAT", "jan", "dec", "xyz", "1-", "-5", "*/1", "1/2", "", " ",
        ];
        let mut rng = rand::rng();
        let now = at(2024, 3, 1, 10, 7, 30);
        for _ in 0..2000 {
            let fields = rng.random_range(3..=6);
            let expression: String = (0..fields)
                .map(|_| {
                    (0..rng.random_range(1..=3))
                        .map(|_| tokens[rng.random_range(0..tokens.len())])
                        .collect::<String>()
                })
                .collect::<Vec<_>>()
                .join(" ");
            if let Ok(expr) = CronExpression::parse(&expression) {
                let next = expr.next_after(now);
                let previous = expr.previous_before(now);
                assert!(next.map_or(true, |t| t > now), "{expression}");
                assert!(previous.map_or(true, |t| t < now), "{expression}");
            }
        }
    }

    #[test]
    fn test_display_normalizes_whitespace() {
        let expr: CronExpression = "  */10   * * * * ".parse().unwrap();
        assert_eq!(expr.to_string(), "*/10 * * * *");
    }
}
