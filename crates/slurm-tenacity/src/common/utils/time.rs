use std::fmt::Write;
use std::time::Duration;

use anyhow::anyhow;
use nom::character::complete::char;
use nom::combinator::{map_res, opt};
use nom::error::context;
use nom::sequence::{preceded, terminated, tuple};

use crate::common::parser::{NomResult, consume_all, p_u64};

const SECONDS_PER_MINUTE: u64 = 60;
const SECONDS_PER_HOUR: u64 = 60 * SECONDS_PER_MINUTE;
const SECONDS_PER_DAY: u64 = 24 * SECONDS_PER_HOUR;
const DAYS_PER_YEAR: u64 = 365;

/// Directives that refer to a calendar date and have no meaning for a duration.
const CALENDAR_DIRECTIVES: &[char] = &[
    'a', 'A', 'w', 'd', 'b', 'B', 'm', 'y', 'U', 'W', 'c', 'x', 'X', 'G', 'u', 'V',
];

/// Formats a duration with a strftime-like `pattern`.
///
/// Supported directives:
/// - `%D`: total number of days
/// - `%Y`: total number of years (365 days each, not zero padded)
/// - `%j`: number of days remaining after `%Y` years (not zero padded)
/// - `%H`, `%M`, `%S`: hours, minutes and seconds of the day (zero padded)
/// - `%%`: literal `%`
///
/// Sub-second precision is truncated.
pub fn format_duration_with(duration: &Duration, pattern: &str) -> anyhow::Result<String> {
    let total = duration.as_secs();
    let days = total / SECONDS_PER_DAY;
    let seconds_of_day = total % SECONDS_PER_DAY;

    let mut output = String::with_capacity(pattern.len() + 8);
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            output.push(c);
            continue;
        }
        let directive = chars
            .next()
            .ok_or_else(|| anyhow!("Dangling `%` at the end of format string {pattern}"))?;
        match directive {
            'D' => write!(output, "{days}")?,
            'Y' => write!(output, "{}", days / DAYS_PER_YEAR)?,
            'j' => write!(output, "{}", days % DAYS_PER_YEAR)?,
            'H' => write!(output, "{:02}", seconds_of_day / SECONDS_PER_HOUR)?,
            'M' => write!(
                output,
                "{:02}",
                (seconds_of_day % SECONDS_PER_HOUR) / SECONDS_PER_MINUTE
            )?,
            'S' => write!(output, "{:02}", seconds_of_day % SECONDS_PER_MINUTE)?,
            '%' => output.push('%'),
            c if CALENDAR_DIRECTIVES.contains(&c) => {
                return Err(anyhow!(
                    "Invalid directive %{c} in format string {pattern}: durations have no calendar date"
                ));
            }
            c => return Err(anyhow!("Unknown directive %{c} in format string {pattern}")),
        }
    }
    Ok(output)
}

/// Format a duration as a Slurm time string with a day count, e.g. `1-01:05:02`.
pub fn format_slurm_duration(duration: &Duration) -> String {
    let mut seconds = duration.as_secs();
    let days = seconds / SECONDS_PER_DAY;
    seconds %= SECONDS_PER_DAY;
    let hours = seconds / SECONDS_PER_HOUR;
    seconds %= SECONDS_PER_HOUR;
    let minutes = seconds / SECONDS_PER_MINUTE;
    seconds %= SECONDS_PER_MINUTE;
    format!("{days}-{hours:02}:{minutes:02}:{seconds:02}")
}

fn sum_time_parts(days: u64, hours: u64, minutes: u64, seconds: u64) -> anyhow::Result<Duration> {
    days.checked_mul(SECONDS_PER_DAY)
        .and_then(|total| total.checked_add(hours.checked_mul(SECONDS_PER_HOUR)?))
        .and_then(|total| total.checked_add(minutes.checked_mul(SECONDS_PER_MINUTE)?))
        .and_then(|total| total.checked_add(seconds))
        .map(Duration::from_secs)
        .ok_or_else(|| anyhow!("Time value is too large"))
}

fn p_hms_time(input: &str) -> NomResult<Duration> {
    map_res(
        context(
            "[[HH:]MM:]SS value",
            tuple((
                p_u64,
                opt(preceded(char(':'), p_u64)),
                opt(preceded(char(':'), p_u64)),
            )),
        ),
        |parsed| match parsed {
            (seconds, None, None) => Ok(Duration::from_secs(seconds)),
            (minutes, Some(seconds), None) => sum_time_parts(0, 0, minutes, seconds),
            (hours, Some(minutes), Some(seconds)) => sum_time_parts(0, hours, minutes, seconds),
            _ => Err(anyhow!("Invalid time specification")),
        },
    )(input)
}

/// `days-hours[:minutes[:seconds]]`
fn p_days_time(input: &str) -> NomResult<Duration> {
    map_res(
        context(
            "D-HH[:MM[:SS]] value",
            tuple((
                terminated(p_u64, char('-')),
                p_u64,
                opt(preceded(char(':'), p_u64)),
                opt(preceded(char(':'), p_u64)),
            )),
        ),
        |(days, hours, minutes, seconds)| match (minutes, seconds) {
            (None, Some(_)) => Err(anyhow!("Invalid time specification")),
            (minutes, seconds) => {
                sum_time_parts(days, hours, minutes.unwrap_or(0), seconds.unwrap_or(0))
            }
        },
    )(input)
}

/// Parses time strings in the format [[hh:]mm:]ss.
/// Individual time values may be zero padded.
pub fn parse_hms_time(input: &str) -> anyhow::Result<Duration> {
    consume_all(p_hms_time, input)
}

/// Parses a duration reported by Slurm (e.g. `Elapsed` or `Reserved` from `sacct`).
///
/// Accepts `[[HH:]MM:]SS` and the day-prefixed `D-HH[:MM[:SS]]` form.
pub fn parse_slurm_duration(input: &str) -> anyhow::Result<Duration> {
    let input = input.trim();
    if input.contains('-') {
        consume_all(p_days_time, input)
    } else {
        parse_hms_time(input)
    }
}

/// Parses either a Slurm duration (`D-HH:MM:SS`, `HH:MM:SS`) or humantime format (`2h`, `3m`).
pub fn parse_slurm_or_human_time(text: &str) -> anyhow::Result<Duration> {
    parse_slurm_duration(text)
        .or_else(|_| humantime::parse_duration(text))
        .map_err(|e| {
            anyhow!(
                "Could not parse walltime. Use either `[D-]HH:MM:SS` or humantime format (2hours): {:?}",
                e
            )
        })
}

/// Multiplies a duration by a factor, rounding to whole seconds.
pub fn scale_duration(duration: Duration, factor: f64) -> Duration {
    Duration::from_secs((duration.as_secs_f64() * factor).round() as u64)
}
