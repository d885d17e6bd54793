use super::expression::CronExpression;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Validity, neighbouring runs and description of an expression at a moment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleInfo {
    pub expression: String,
    pub is_valid: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub previous_run: Option<DateTime<Utc>>,
    pub description: String,
}

/// Evaluate `expression` against `now`. Never fails: a malformed expression
/// yields `is_valid = false` with no runs.
pub fn schedule_info(expression: &str, now: DateTime<Utc>) -> ScheduleInfo {
    let description = describe(expression);
    match CronExpression::parse(expression) {
        Ok(parsed) => ScheduleInfo {
            expression: expression.to_string(),
            is_valid: true,
            next_run: parsed.next_after(now),
            previous_run: parsed.previous_before(now),
            description,
        },
        Err(_) => ScheduleInfo {
            expression: expression.to_string(),
            is_valid: false,
            next_run: None,
            previous_run: None,
            description,
        },
    }
}

pub fn next_run(expression: &str, now: DateTime<Utc>) -> ScheduleInfo {
    schedule_info(expression, now)
}

pub fn previous_run(expression: &str, now: DateTime<Utc>) -> ScheduleInfo {
    schedule_info(expression, now)
}

fn every(field: &str) -> Option<u32> {
    field.strip_prefix("*/")?.parse().ok()
}

fn hour(field: &str) -> Option<u32> {
    field.parse().ok().filter(|h| *h < 24)
}

/// Short human description of common schedules; anything else is returned
/// unchanged.
pub fn describe(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let [minute, hour_field, dom, month, dow] = fields[..] else {
        return expression.to_string();
    };

    if hour_field == "*" && dom == "*" && month == "*" && dow == "*" {
        if let Some(n) = every(minute) {
            return match n {
                1 => "Every minute".to_string(),
                n => format!("Every {n} minutes"),
            };
        }
        if minute == "0" {
            return "Hourly".to_string();
        }
    }

    if minute != "0" || month != "*" {
        return expression.to_string();
    }

    if dom == "*" && dow == "*" {
        if let Some(n) = every(hour_field) {
            return match n {
                1 => "Hourly".to_string(),
                n => format!("Every {n} hours"),
            };
        }
    }

    let Some(h) = hour(hour_field) else {
        return expression.to_string();
    };
    match (dom, dow) {
        ("*", "*") => format!("Daily at {h}:00"),
        ("*", "0") => format!("Weekly on Sunday at {h}:00"),
        ("1", "*") => format!("Monthly on the 1st at {h}:00"),
        _ => expression.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_descriptions() {
        assert_eq!(describe("*/15 * * * *"), "Every 15 minutes");
        assert_eq!(describe("0 */6 * * *"), "Every 6 hours");
        assert_eq!(describe("0 * * * *"), "Hourly");
        assert_eq!(describe("0 3 * * *"), "Daily at 3:00");
        assert_eq!(describe("0 6 * * 0"), "Weekly on Sunday at 6:00");
        assert_eq!(describe("0 04 1 * *"), "Monthly on the 1st at 4:00");
    }

    #[test]
    fn test_single_unit_steps() {
        assert_eq!(describe("*/1 * * * *"), "Every minute");
        assert_eq!(describe("0 */1 * * *"), "Hourly");
        assert_eq!(describe("*/2 * * * *"), "Every 2 minutes");
    }

    #[test]
    fn test_other_expressions_unchanged() {
        assert_eq!(describe("1 2 3"), "1 2 3");
        assert_eq!(describe("30 3 * * *"), "30 3 * * *");
        assert_eq!(describe("0 6 * * 1"), "0 6 * * 1");
        assert_eq!(describe("0 25 * * *"), "0 25 * * *");
        assert_eq!(describe("not a cron"), "not a cron");
    }

    #[test]
    fn test_invalid_expression_info() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 7, 0).unwrap();
        let info = next_run("not a cron", now);
        assert!(!info.is_valid);
        assert_eq!(info.next_run, None);
        assert_eq!(info.previous_run, None);
        assert_eq!(info.description, "not a cron");
    }

    #[test]
    fn test_oversized_step_is_invalid_not_fatal() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 7, 0).unwrap();
        let info = next_run("1/4294967295 * * * *", now);
        assert!(!info.is_valid);
        assert_eq!(info.next_run, None);
        assert_eq!(previous_run("1/4294967295 * * * *", now).previous_run, None);
    }

    #[test]
    fn test_valid_expression_info() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 7, 0).unwrap();
        let info = schedule_info("*/5 * * * *", now);
        assert!(info.is_valid);
        let next = info.next_run.unwrap();
        assert!(next > now);
        assert_eq!(next.minute() % 5, 0);
        assert_eq!(
            info.previous_run,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 5, 0).unwrap())
        );
        assert_eq!(
            previous_run("*/5 * * * *", now).previous_run,
            info.previous_run
        );
    }
}
