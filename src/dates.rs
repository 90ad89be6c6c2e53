//! Duration and deadline parsing for CLI flags.
//!
//! Supports expressions like "200ms", "30s", "2h" for durations and
//! "30m", "tomorrow", "friday", "2026-01-27T10:00:00Z" for deadlines.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc, Weekday};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

/// Matches: "200ms", "30s", "5m", "2h", "1d", "1w"
static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\s*(ms|s|m|h|d|w)$").expect("valid duration regex"));

/// Parse a duration flag such as `--stop-after 30s`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let raw = input.trim();
    if raw.is_empty() {
        return Err("empty duration".to_string());
    }

    let lower = raw.to_lowercase();
    let caps = DURATION_RE
        .captures(&lower)
        .ok_or_else(|| format!("invalid duration {raw:?} (try 500ms, 30s, 5m, 2h)"))?;
    let value: u64 = caps[1]
        .parse()
        .map_err(|_| format!("invalid number in {raw:?}"))?;

    let seconds_per_unit = match &caps[2] {
        "ms" => return Ok(Duration::from_millis(value)),
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        "w" => 7 * 24 * 60 * 60,
        unit => return Err(format!("invalid duration unit {unit:?}")),
    };
    value
        .checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration {raw:?} is too large"))
}

/// Parse a deadline flag such as `--until 30m` into an absolute time.
///
/// # Supported formats
/// - Relative: "90s", "30m", "2h", "1d" (from `now`)
/// - Named: "tomorrow" (start of day, UTC)
/// - Weekdays: "monday", "next friday" (next occurrence, start of day)
/// - Date: "2026-01-27" (YYYY-MM-DD, UTC midnight)
/// - RFC3339: "2026-01-27T10:00:00Z"
///
/// Times in the past are returned as-is; the caller decides what an already
/// elapsed deadline means.
pub fn parse_deadline(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    let raw = input.trim();
    if raw.is_empty() {
        return Err("empty deadline".to_string());
    }

    let lower = raw.to_lowercase();
    if lower == "tomorrow" {
        return Ok(start_of_day(now) + chrono::Duration::days(1));
    }

    if let Some(deadline) = parse_weekday(&lower, now) {
        return Ok(deadline);
    }

    if DURATION_RE.is_match(&lower) {
        let duration = parse_duration(&lower)?;
        let duration = chrono::Duration::from_std(duration)
            .map_err(|_| format!("deadline {raw:?} is too far away"))?;
        return now
            .checked_add_signed(duration)
            .ok_or_else(|| format!("deadline {raw:?} is too far away"));
    }

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let dt = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| format!("invalid date {raw:?}"))?;
        return Ok(Utc.from_utc_datetime(&dt));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }

    Err(format!("invalid deadline {raw:?}"))
}

fn start_of_day(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(dt)
}

fn parse_weekday(input: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let s = input.strip_prefix("next ").map(str::trim).unwrap_or(input);

    let target_weekday = match s {
        "sun" | "sunday" => Weekday::Sun,
        "mon" | "monday" => Weekday::Mon,
        "tue" | "tues" | "tuesday" => Weekday::Tue,
        "wed" | "weds" | "wednesday" => Weekday::Wed,
        "thu" | "thur" | "thurs" | "thursday" => Weekday::Thu,
        "fri" | "friday" => Weekday::Fri,
        "sat" | "saturday" => Weekday::Sat,
        _ => return None,
    };

    let base = start_of_day(now);
    let mut delta = (target_weekday.num_days_from_sunday() as i64)
        - (base.weekday().num_days_from_sunday() as i64);
    if delta <= 0 {
        delta += 7;
    }

    Some(base + chrono::Duration::days(delta))
}
