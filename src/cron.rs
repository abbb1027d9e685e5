//! Five-field cron expressions.
//!
//! Supported syntax per field: `*`, single values, inclusive ranges (`a-b`),
//! steps (`*/n`, `a-b/n`, `a/n`) and comma-separated unions of those.
//! Matching is done against UTC wall-clock time.

use chrono::{DateTime, Datelike, NaiveTime, TimeDelta, Timelike, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Upper bound of the search window used by [`CronSchedule::next`]. Four
/// years always contains a Feb 29.
const SEARCH_HORIZON_DAYS: i64 = 4 * 365;

/// Returned by [`CronSchedule::next`] when nothing matches inside the horizon.
const FALLBACK_DAYS: i64 = 365;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CronError {
    #[error("invalid cron expression: expected 5 fields, got {0}")]
    FieldCount(usize),
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    spec: String,
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days_of_month: BTreeSet<u32>,
    months: BTreeSet<u32>,
    /// 0-6, Sunday = 0.
    days_of_week: BTreeSet<u32>,
}

impl CronSchedule {
    /// Parses `"minute hour day-of-month month day-of-week"`.
    ///
    /// ```
    /// use schedcuter::CronSchedule;
    ///
    /// assert!(CronSchedule::parse("0 9-17 * * 1-5").is_ok());
    /// assert!(CronSchedule::parse("0 0 * *").is_err());
    /// ```
    pub fn parse(spec: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = spec.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        let field = |index: usize, name: &'static str, min: u32, max: u32| {
            parse_field(fields[index], min, max)
                .map_err(|reason| CronError::InvalidField { field: name, reason })
        };

        Ok(Self {
            spec: fields.join(" "),
            minutes: field(0, "minute", 0, 59)?,
            hours: field(1, "hour", 0, 23)?,
            days_of_month: field(2, "day-of-month", 1, 31)?,
            months: field(3, "month", 1, 12)?,
            days_of_week: field(4, "day-of-week", 0, 6)?,
        })
    }

    /// The normalized source expression.
    pub fn spec(&self) -> &str {
        &self.spec
    }

    /// Returns the first matching minute strictly after `after`.
    ///
    /// If no minute matches within four years (e.g. `0 0 31 2 *`), a time one
    /// year after `after` is returned. Treat that as "effectively never".
    pub fn next(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let fallback = after
            .checked_add_signed(TimeDelta::days(FALLBACK_DAYS))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let first_minute = after.timestamp().div_euclid(60) * 60 + 60;
        let Some(mut candidate) = DateTime::from_timestamp(first_minute, 0) else {
            return fallback;
        };
        let Some(horizon) = candidate.checked_add_signed(TimeDelta::days(SEARCH_HORIZON_DAYS))
        else {
            return fallback;
        };

        // Whole days and hours that cannot match are skipped; the result is
        // the same as stepping one minute at a time.
        while candidate < horizon {
            if !self.matches_day(candidate) {
                candidate = candidate.date_naive().and_time(NaiveTime::MIN).and_utc()
                    + TimeDelta::days(1);
                continue;
            }
            if !self.hours.contains(&candidate.hour()) {
                candidate = candidate - TimeDelta::minutes(i64::from(candidate.minute()))
                    + TimeDelta::hours(1);
                continue;
            }
            if self.minutes.contains(&candidate.minute()) {
                return candidate;
            }
            candidate += TimeDelta::minutes(1);
        }

        fallback
    }

    /// Whether `t` falls on a minute selected by all five fields.
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.minutes.contains(&t.minute()) && self.hours.contains(&t.hour()) && self.matches_day(t)
    }

    fn matches_day(&self, t: DateTime<Utc>) -> bool {
        self.days_of_month.contains(&t.day())
            && self.months.contains(&t.month())
            && self.days_of_week.contains(&t.weekday().num_days_from_sunday())
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.spec)
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Parses one cron field into the set of values it selects within
/// `min..=max`.
pub fn parse_field(field: &str, min: u32, max: u32) -> Result<BTreeSet<u32>, String> {
    if field.contains(',') {
        let mut values = BTreeSet::new();
        for part in field.split(',') {
            values.extend(parse_field(part, min, max)?);
        }
        return Ok(values);
    }

    if let Some((base, step)) = field.split_once('/') {
        let step = parse_number(step)
            .filter(|step| *step > 0)
            .ok_or_else(|| format!("invalid step value: {step}"))?;
        let (start, end) = if base == "*" {
            (min, max)
        } else if base.contains('-') {
            parse_range(base, min, max)?
        } else {
            (parse_value(base, min, max)?, max)
        };
        return Ok((start..=end).step_by(step as usize).collect());
    }

    if field == "*" {
        return Ok((min..=max).collect());
    }

    if field.contains('-') {
        let (start, end) = parse_range(field, min, max)?;
        return Ok((start..=end).collect());
    }

    parse_value(field, min, max).map(|value| BTreeSet::from([value]))
}

fn parse_range(field: &str, min: u32, max: u32) -> Result<(u32, u32), String> {
    let Some((start, end)) = field.split_once('-') else {
        return Err(format!("invalid range: {field}"));
    };
    let start = parse_number(start)
        .filter(|v| (min..=max).contains(v))
        .ok_or_else(|| format!("invalid range start: {start}"))?;
    let end = parse_number(end)
        .filter(|v| (min..=max).contains(v) && *v >= start)
        .ok_or_else(|| format!("invalid range end: {end}"))?;
    Ok((start, end))
}

fn parse_value(field: &str, min: u32, max: u32) -> Result<u32, String> {
    parse_number(field)
        .filter(|v| (min..=max).contains(v))
        .ok_or_else(|| format!("invalid value: {field} (must be between {min} and {max})"))
}

fn parse_number(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
