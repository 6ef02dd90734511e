//! Timer scheduler
//!
//! Turns `wait_until` / `start_delay` into a wait decision, computed once when
//! a statement becomes eligible. Everything is resolved against the durable
//! clock so replay reaches the same instant.
//!
//! Accepted `wait_until` forms (case-insensitive, times in UTC):
//!
//! - RFC 3339: `2024-05-02T09:00:00Z`
//! - `YYYY-MM-DD`, `YYYY-MM-DD HH:MM[:SS]`, `YYYY-MM-DDTHH:MM[:SS]`
//! - relative: `in 1 hour`, `30 minutes from now`, `2d`, `an hour ago`
//! - day and time: `9am tomorrow`, `tomorrow at 17:30`, `today noon`, `midnight`
//! - `now`, `today`, `tomorrow`
//!
//! A time of day without a day picks its next occurrence.

use std::sync::OnceLock;

use chrono::{
    DateTime, Days, Duration as ChronoDuration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
    Utc,
};
use regex::{Captures, Regex};
use serde_json::Value;

use crate::dsl::ActionStatement;
use crate::expression::{self, ExpressionError, ExpressionEvaluator};

/// Longest accepted `start_delay`: one hundred years
pub const MAX_DELAY_SECS: f64 = 100.0 * 365.0 * 86_400.0;

/// Errors from resolving wait instructions
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScheduleError {
    #[error("cannot parse time expression '{0}'")]
    Unparsable(String),

    #[error("wait_until must evaluate to a string or epoch seconds, got {0}")]
    InvalidValue(String),

    #[error("start_delay must not be negative (got {0})")]
    NegativeDelay(f64),

    #[error("start_delay must be at most {max} seconds (got {0})", max = MAX_DELAY_SECS)]
    DelayTooLong(f64),

    #[error("wait target is outside the representable time range")]
    OutOfRange,

    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

/// What to do before a statement's first attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitDecision {
    /// Run now
    Proceed,
    /// Suspend on one durable timer until this instant
    Until(DateTime<Utc>),
}

impl WaitDecision {
    /// Timer duration from `now`, if a timer is needed
    pub fn timer_duration(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        match self {
            WaitDecision::Proceed => None,
            WaitDecision::Until(at) => (*at - now).to_std().ok().filter(|d| !d.is_zero()),
        }
    }
}

/// Resolve a statement's wait instruction at the moment it became eligible
///
/// `wait_until` wins over `start_delay`; instants at or before `now` need no
/// timer.
pub fn resolve_wait(
    statement: &ActionStatement,
    now: DateTime<Utc>,
    evaluator: &dyn ExpressionEvaluator,
    bindings: &Value,
) -> Result<WaitDecision, ScheduleError> {
    let target = if let Some(wait_until) = &statement.wait_until {
        let value = if expression::is_template(wait_until) {
            expression::render(evaluator, &Value::String(wait_until.clone()), bindings, &[])?
        } else {
            Value::String(wait_until.clone())
        };
        Some(instant_from_value(&value, now)?)
    } else if let Some(delay) = statement.start_delay {
        let at = now
            .checked_add_signed(delay_duration(delay)?)
            .ok_or(ScheduleError::OutOfRange)?;
        Some(at)
    } else {
        None
    };

    Ok(match target {
        Some(at) if at > now => WaitDecision::Until(at),
        _ => WaitDecision::Proceed,
    })
}

/// Check a `start_delay` and convert it to a duration
pub fn delay_duration(seconds: f64) -> Result<ChronoDuration, ScheduleError> {
    if seconds.is_nan() || seconds < 0.0 {
        return Err(ScheduleError::NegativeDelay(seconds));
    }
    if seconds > MAX_DELAY_SECS {
        return Err(ScheduleError::DelayTooLong(seconds));
    }
    millis(seconds).ok_or(ScheduleError::DelayTooLong(seconds))
}

/// Whole milliseconds, or `None` when `seconds` does not fit a duration
fn millis(seconds: f64) -> Option<ChronoDuration> {
    let ms = (seconds * 1000.0).round();
    if !ms.is_finite() || ms.abs() >= i64::MAX as f64 {
        return None;
    }
    ChronoDuration::try_milliseconds(ms as i64)
}

/// Statically check a literal `wait_until`; templates are checked for syntax only
pub fn validate_wait_until(
    source: &str,
    evaluator: &dyn ExpressionEvaluator,
) -> Result<(), ScheduleError> {
    if expression::is_template(source) {
        expression::validate_template(evaluator, &Value::String(source.to_string()))?;
        return Ok(());
    }
    parse_time_expression(source, DateTime::<Utc>::UNIX_EPOCH).map(|_| ())
}

fn instant_from_value(value: &Value, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    match value {
        Value::String(s) => parse_time_expression(s, now),
        Value::Number(n) => n
            .as_f64()
            .and_then(|secs| Utc.timestamp_millis_opt((secs * 1000.0).round() as i64).single())
            .ok_or_else(|| ScheduleError::InvalidValue(n.to_string())),
        other => Err(ScheduleError::InvalidValue(
            crate::outcome::typename_of(other).to_string(),
        )),
    }
}

fn relative_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?:in\s+)?(?P<n>\d+(?:\.\d+)?|an?|one)\s*(?P<unit>seconds?|secs?|s|minutes?|mins?|m|hours?|hrs?|h|days?|d|weeks?|w)(?:\s+(?P<dir>from now|later|ago))?$",
        )
        .expect("valid relative time pattern")
    })
}

fn clock_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?:(?P<day1>today|tomorrow)\s+)?(?:at\s+)?(?P<time>noon|midnight|(?P<h>\d{1,2})(?::(?P<m>\d{2})(?::(?P<s>\d{2}))?)?\s*(?P<ampm>am|pm)?)(?:\s+(?:at\s+)?(?P<day2>today|tomorrow))?$",
        )
        .expect("valid time-of-day pattern")
    })
}

/// Parse a `wait_until` string relative to `now`
pub fn parse_time_expression(
    text: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    let input = text.trim();
    let unparsable = || ScheduleError::Unparsable(text.to_string());

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN).and_utc());
    }

    let lower = input.to_lowercase();
    let lower = lower.split_whitespace().collect::<Vec<_>>().join(" ");
    match lower.as_str() {
        "now" | "today" => return Ok(now),
        "tomorrow" => return now.checked_add_days(Days::new(1)).ok_or_else(unparsable),
        _ => {}
    }

    if let Some(caps) = relative_pattern().captures(&lower) {
        return relative(&caps, now).ok_or_else(unparsable);
    }
    if let Some(caps) = clock_pattern().captures(&lower) {
        return time_of_day(&caps, now).ok_or_else(unparsable);
    }
    Err(unparsable())
}

fn relative(caps: &Captures<'_>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let amount = match &caps["n"] {
        "a" | "an" | "one" => 1.0,
        n => n.parse::<f64>().ok()?,
    };
    let unit_secs = match &caps["unit"] {
        "s" | "sec" | "secs" | "second" | "seconds" => 1.0,
        "m" | "min" | "mins" | "minute" | "minutes" => 60.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600.0,
        "d" | "day" | "days" => 86_400.0,
        _ => 604_800.0,
    };
    let offset = millis(amount * unit_secs)?;
    match caps.name("dir").map(|m| m.as_str()) {
        Some("ago") => now.checked_sub_signed(offset),
        _ => now.checked_add_signed(offset),
    }
}

fn time_of_day(caps: &Captures<'_>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (hour, minute, second) = match &caps["time"] {
        "noon" => (12, 0, 0),
        "midnight" => (0, 0, 0),
        _ => {
            let h: u32 = caps["h"].parse().ok()?;
            let m: u32 = caps.name("m").map_or(Some(0), |m| m.as_str().parse().ok())?;
            let s: u32 = caps.name("s").map_or(Some(0), |s| s.as_str().parse().ok())?;
            let hour = match caps.name("ampm").map(|m| m.as_str()) {
                Some(ampm) => {
                    if !(1..=12).contains(&h) {
                        return None;
                    }
                    (h % 12) + if ampm == "pm" { 12 } else { 0 }
                }
                // bare "9" is ambiguous
                None if caps.name("m").is_none() => return None,
                None => h,
            };
            (hour, m, s)
        }
    };
    let time = NaiveTime::from_hms_opt(hour, minute, second)?;

    let day = caps.name("day1").or_else(|| caps.name("day2")).map(|m| m.as_str());
    let today = now.date_naive();
    let at = |date: NaiveDate| date.and_time(time).and_utc();
    match day {
        Some("today") => Some(at(today)),
        Some(_) => today.checked_add_days(Days::new(1)).map(at),
        None => {
            let candidate = at(today);
            if candidate > now {
                Some(candidate)
            } else {
                today.checked_add_days(Days::new(1)).map(at)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::TemplateEvaluator;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        "2024-05-01T15:00:00Z".parse().unwrap()
    }

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn parse(s: &str) -> DateTime<Utc> {
        parse_time_expression(s, now()).unwrap()
    }

    #[test]
    fn test_absolute_forms() {
        assert_eq!(parse("2024-05-02T09:00:00Z"), at("2024-05-02T09:00:00Z"));
        assert_eq!(parse("2024-05-02T11:00:00+02:00"), at("2024-05-02T09:00:00Z"));
        assert_eq!(parse("2024-05-02 09:00"), at("2024-05-02T09:00:00Z"));
        assert_eq!(parse("2024-05-02 09:00:30"), at("2024-05-02T09:00:30Z"));
        assert_eq!(parse("2024-05-02"), at("2024-05-02T00:00:00Z"));
    }

    #[test]
    fn test_relative_forms() {
        let hour_later = at("2024-05-01T16:00:00Z");
        assert_eq!(parse("in 1 hour"), hour_later);
        assert_eq!(parse("In an hour"), hour_later);
        assert_eq!(parse("60 minutes from now"), hour_later);
        assert_eq!(parse("1h"), hour_later);
        assert_eq!(parse("in 90 seconds"), at("2024-05-01T15:01:30Z"));
        assert_eq!(parse("in 2 days"), at("2024-05-03T15:00:00Z"));
        assert_eq!(parse("1 week"), at("2024-05-08T15:00:00Z"));
        assert_eq!(parse("1.5 hours"), at("2024-05-01T16:30:00Z"));
        assert_eq!(parse("2 hours ago"), at("2024-05-01T13:00:00Z"));
    }

    #[test]
    fn test_time_of_day_forms() {
        let nine_tomorrow = at("2024-05-02T09:00:00Z");
        assert_eq!(parse("9am tomorrow"), nine_tomorrow);
        assert_eq!(parse("tomorrow 9am"), nine_tomorrow);
        assert_eq!(parse("tomorrow at 9:00am"), nine_tomorrow);
        assert_eq!(parse("tomorrow at 09:00"), nine_tomorrow);
        // 9am already passed today
        assert_eq!(parse("9am"), nine_tomorrow);
        assert_eq!(parse("5:30pm"), at("2024-05-01T17:30:00Z"));
        assert_eq!(parse("today at noon"), at("2024-05-01T12:00:00Z"));
        assert_eq!(parse("midnight"), at("2024-05-02T00:00:00Z"));
        assert_eq!(parse("12am tomorrow"), at("2024-05-02T00:00:00Z"));
        assert_eq!(parse("12pm tomorrow"), at("2024-05-02T12:00:00Z"));
        assert_eq!(parse("tomorrow"), at("2024-05-02T15:00:00Z"));
    }

    #[test]
    fn test_unparsable() {
        for bad in ["", "soon", "9", "25:00", "13pm", "in many hours", "tomorrow-ish"] {
            assert!(
                matches!(parse_time_expression(bad, now()), Err(ScheduleError::Unparsable(_))),
                "{bad}"
            );
        }
    }

    fn stmt() -> ActionStatement {
        ActionStatement::new("a", "core.noop")
    }

    #[test]
    fn test_past_wait_until_proceeds() {
        let eval = TemplateEvaluator::new();
        let mut s = stmt();
        s.wait_until = Some("2024-05-01T14:00:00Z".into());
        let decision = resolve_wait(&s, now(), &eval, &json!({})).unwrap();
        assert_eq!(decision, WaitDecision::Proceed);
        assert_eq!(decision.timer_duration(now()), None);
    }

    #[test]
    fn test_equivalent_strings_resolve_to_same_instant() {
        let eval = TemplateEvaluator::new();
        let mut relative = stmt();
        relative.wait_until = Some("in 1 hour".into());
        let mut absolute = stmt();
        absolute.wait_until = Some("2024-05-01T16:00:00Z".into());

        let a = resolve_wait(&relative, now(), &eval, &json!({})).unwrap();
        let b = resolve_wait(&absolute, now(), &eval, &json!({})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.timer_duration(now()), Some(std::time::Duration::from_secs(3600)));
    }

    #[test]
    fn test_wait_until_takes_precedence() {
        let eval = TemplateEvaluator::new();
        let mut s = stmt();
        s.wait_until = Some("in 10 minutes".into());
        s.start_delay = Some(5.0);
        assert_eq!(
            resolve_wait(&s, now(), &eval, &json!({})).unwrap(),
            WaitDecision::Until(at("2024-05-01T15:10:00Z"))
        );

        s.wait_until = None;
        assert_eq!(
            resolve_wait(&s, now(), &eval, &json!({})).unwrap(),
            WaitDecision::Until(at("2024-05-01T15:00:05Z"))
        );

        s.start_delay = Some(0.0);
        assert_eq!(resolve_wait(&s, now(), &eval, &json!({})).unwrap(), WaitDecision::Proceed);
    }

    #[test]
    fn test_templated_wait_until() {
        let eval = TemplateEvaluator::new();
        let mut s = stmt();
        s.wait_until = Some("${{ TRIGGER.when }}".into());

        let bindings = json!({"TRIGGER": {"when": "tomorrow at 9am"}});
        assert_eq!(
            resolve_wait(&s, now(), &eval, &bindings).unwrap(),
            WaitDecision::Until(at("2024-05-02T09:00:00Z"))
        );

        let epoch = json!({"TRIGGER": {"when": at("2024-05-01T15:00:10Z").timestamp()}});
        assert_eq!(
            resolve_wait(&s, now(), &eval, &epoch).unwrap(),
            WaitDecision::Until(at("2024-05-01T15:00:10Z"))
        );

        let garbage = json!({"TRIGGER": {"when": "whenever"}});
        assert!(matches!(
            resolve_wait(&s, now(), &eval, &garbage),
            Err(ScheduleError::Unparsable(_))
        ));

        let missing = json!({"TRIGGER": {}});
        assert!(matches!(
            resolve_wait(&s, now(), &eval, &missing),
            Err(ScheduleError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_validation() {
        let eval = TemplateEvaluator::new();
        assert!(validate_wait_until("in 1 hour", &eval).is_ok());
        assert!(validate_wait_until("${{ TRIGGER.when }}", &eval).is_ok());
        assert!(validate_wait_until("next blue moon", &eval).is_err());
        assert!(validate_wait_until("${{ TRIGGER. }}", &eval).is_err());
        assert_eq!(delay_duration(-1.0), Err(ScheduleError::NegativeDelay(-1.0)));
        assert!(matches!(delay_duration(f64::NAN), Err(ScheduleError::NegativeDelay(_))));
        assert_eq!(delay_duration(1.0e16), Err(ScheduleError::DelayTooLong(1.0e16)));
        assert_eq!(
            delay_duration(f64::INFINITY),
            Err(ScheduleError::DelayTooLong(f64::INFINITY))
        );
        assert_eq!(delay_duration(90.5), Ok(ChronoDuration::milliseconds(90_500)));
    }

    #[test]
    fn test_huge_waits_do_not_overflow() {
        let eval = TemplateEvaluator::new();
        let mut s = stmt();
        s.start_delay = Some(1.0e16);
        assert_eq!(
            resolve_wait(&s, now(), &eval, &json!({})),
            Err(ScheduleError::DelayTooLong(1.0e16))
        );

        // In range for validation, past the calendar at the end of time
        s.start_delay = Some(MAX_DELAY_SECS);
        assert_eq!(
            resolve_wait(&s, DateTime::<Utc>::MAX_UTC, &eval, &json!({})),
            Err(ScheduleError::OutOfRange)
        );

        assert!(matches!(
            parse_time_expression("in 99999999999999999999 weeks", now()),
            Err(ScheduleError::Unparsable(_))
        ));
        assert!(matches!(
            parse_time_expression("tomorrow", DateTime::<Utc>::MAX_UTC),
            Err(ScheduleError::Unparsable(_))
        ));
    }
}
