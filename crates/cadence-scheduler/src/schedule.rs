use std::str::FromStr;

use cadence_core::config::MAX_DELAY_SECS;
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;

use crate::error::{Result, SchedulerError};
use crate::types::{Job, ScheduleType};

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Convert a standard 5-field Unix cron expression to the 7-field form the
/// `cron` crate expects (seconds first, year last). 6/7-field expressions
/// pass through untouched; anything else is left for the parser to reject.
///
/// The `cron` crate numbers weekdays 1-7 from Sunday while Unix cron uses
/// 0-6 (7 also meaning Sunday), so numeric day-of-week items are rewritten as
/// day names.
fn to_cron_crate_format(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if let [minute, hour, day, month, weekday] = fields.as_slice() {
        format!("0 {minute} {hour} {day} {month} {} *", unix_weekdays(weekday))
    } else {
        expression.trim().to_string()
    }
}

/// Rewrite a Unix day-of-week field. `*`/`?` and `*/n` keep their meaning in
/// both numberings (both start at Sunday); named items are shared too. Items
/// that are not valid Unix syntax are returned as-is for the parser to reject.
fn unix_weekdays(field: &str) -> String {
    field
        .split(',')
        .map(|item| match unix_weekday_item(item) {
            Some(days) => days
                .iter()
                .map(|&d| WEEKDAYS[d])
                .collect::<Vec<_>>()
                .join(","),
            None => item.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Expand one numeric item (`n`, `a-b`, `a-b/s`, `n/s`) into Unix day
/// numbers 0-6. `None` for wildcards, names and malformed input.
fn unix_weekday_item(item: &str) -> Option<Vec<usize>> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, step.parse::<usize>().ok().filter(|s| *s > 0)?),
        None => (item, 1),
    };
    let (start, end) = match range.split_once('-') {
        Some((a, b)) => (a.parse::<usize>().ok()?, b.parse::<usize>().ok()?),
        // `n/s` runs from n to the end of the week
        None if item.contains('/') => (range.parse::<usize>().ok()?, 6),
        None => {
            let n = range.parse::<usize>().ok()?;
            (n, n)
        }
    };
    if start > end || end > 7 {
        return None;
    }
    let mut days: Vec<usize> = (start..=end).step_by(step).map(|d| d % 7).collect();
    days.sort_unstable();
    days.dedup();
    Some(days)
}

/// Latest instant the store can hold: year 9999 keeps the fixed-width
/// timestamp format, and therefore SQL string ordering, intact.
pub fn latest_instant() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(253_402_300_799_999)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Reject delays (intervals, retry delays) beyond `MAX_DELAY_SECS`.
pub fn check_delay(what: &str, secs: u64) -> Result<u64> {
    if secs > MAX_DELAY_SECS {
        return Err(SchedulerError::InvalidSchedule(format!(
            "{what} of {secs}s exceeds the maximum of {MAX_DELAY_SECS}s"
        )));
    }
    Ok(secs)
}

/// Parse `expression`, failing with `InvalidSchedule` on bad syntax.
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    if expression.trim().is_empty() {
        return Err(SchedulerError::InvalidSchedule(
            "cron expression is empty".to_string(),
        ));
    }
    Schedule::from_str(&to_cron_crate_format(expression))
        .map_err(|e| SchedulerError::InvalidSchedule(format!("{expression}: {e}")))
}

/// Next firing of `expression` strictly after `after` (UTC).
pub fn next_cron_run(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    parse_cron(expression)?
        .after(&after)
        .next()
        .ok_or_else(|| {
            SchedulerError::InvalidSchedule(format!("{expression}: no future firing"))
        })
}

/// Parse the INTERVAL schedule expression (whole seconds, > 0).
pub fn parse_interval(expression: &str) -> Result<u64> {
    let secs: u64 = expression.trim().parse().map_err(|_| {
        SchedulerError::InvalidSchedule(format!("interval must be whole seconds, got '{expression}'"))
    })?;
    if secs == 0 {
        return Err(SchedulerError::InvalidSchedule(
            "interval must be greater than zero".to_string(),
        ));
    }
    check_delay("interval", secs)
}

/// `at + secs`, saturating at [`latest_instant`].
pub fn add_seconds(at: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|d| at.checked_add_signed(d))
        .map_or_else(latest_instant, |dt| dt.min(latest_instant()))
}

/// Compute when a recurring job should run next after a successful run that
/// finished at `completed_at`. Returns `None` for ONCE jobs.
pub fn next_run_after_success(
    job: &Job,
    completed_at: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let expression = job.schedule_expression.as_deref().unwrap_or_default();
    match job.schedule_type {
        ScheduleType::Once => Ok(None),
        ScheduleType::Cron => next_cron_run(expression, completed_at).map(Some),
        ScheduleType::Interval => {
            let secs = parse_interval(expression)?;
            Ok(Some(add_seconds(completed_at, secs)))
        }
    }
}
