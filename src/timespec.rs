//! Start/end time expressions of metrics range queries

use chrono::{DateTime, Duration, Local, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Parse a time expression relative to `now`.
///
/// Accepted forms: `now`, `today`, `yesterday`, `tomorrow` (local midnight),
/// relative offsets (`-1h`, `+30m`, `2d`, `1 hour ago`; unsigned means past),
/// unix seconds, RFC 3339, RFC 2822 and `YYYY-MM-DD[ HH:MM[:SS]]` in local
/// time.
pub fn parse_time_expression(expr: &str, now: DateTime<Local>) -> Result<DateTime<Utc>, String> {
    let arg = expr.trim();
    if arg.is_empty() {
        return Err("empty time expression".to_string());
    }

    match arg.to_ascii_lowercase().as_str() {
        "now" => return Ok(now.with_timezone(&Utc)),
        "today" => return local_midnight(now.date_naive()),
        "yesterday" => return local_midnight(now.date_naive() - Duration::days(1)),
        "tomorrow" => return local_midnight(now.date_naive() + Duration::days(1)),
        _ => {}
    }

    if let Some(past) = arg.strip_suffix(" ago") {
        let offset = parse_offset(past.trim())?;
        return shift(now, -offset.abs());
    }

    if looks_like_offset(arg) {
        return shift(now, parse_offset(arg)?);
    }

    if let Some(ts) = parse_unix_seconds(arg) {
        return Ok(ts);
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(arg) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc2822(arg) {
        return Ok(ts.with_timezone(&Utc));
    }

    parse_local_datetime(arg).ok_or_else(|| format!("cannot parse time expression '{}'", expr))
}

fn local_midnight(date: NaiveDate) -> Result<DateTime<Utc>, String> {
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| format!("invalid date {}", date))?;
    from_local(midnight).ok_or_else(|| format!("{} does not exist in local time", midnight))
}

fn from_local(naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    match Local.from_local_datetime(&naive) {
        LocalResult::Single(ts) => Some(ts.with_timezone(&Utc)),
        // the earlier instant of an ambiguous (DST fall-back) wall time
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

fn shift(now: DateTime<Local>, offset: Duration) -> Result<DateTime<Utc>, String> {
    now.with_timezone(&Utc)
        .checked_add_signed(offset)
        .ok_or_else(|| "relative time is out of supported range".to_string())
}

/// A signed or unsigned number followed by a time unit
fn looks_like_offset(arg: &str) -> bool {
    let rest = arg.strip_prefix(['+', '-']).unwrap_or(arg);
    let Some(unit_at) = rest.find(|c: char| !c.is_ascii_digit()) else {
        return false;
    };
    unit_at > 0 && unit_factor(rest[unit_at..].trim_start()).is_some()
}

fn unit_factor(unit: &str) -> Option<i64> {
    let factor = match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hour" | "hours" => 3_600,
        "d" | "day" | "days" => 86_400,
        "w" | "week" | "weeks" => 604_800,
        _ => return None,
    };
    Some(factor)
}

/// Parse `+30m`, `-1h`, `2d`; unsigned offsets point into the past
fn parse_offset(arg: &str) -> Result<Duration, String> {
    let (sign, rest) = if let Some(stripped) = arg.strip_prefix('-') {
        (-1, stripped)
    } else if let Some(stripped) = arg.strip_prefix('+') {
        (1, stripped)
    } else {
        (-1, arg)
    };

    let unit_at = rest
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("relative time '{}' needs a unit (s, m, h, d, w)", arg))?;
    let (digits, unit) = (&rest[..unit_at], rest[unit_at..].trim_start());

    let amount: i64 = digits
        .parse()
        .map_err(|_| format!("invalid number in relative time '{}'", arg))?;
    let factor = unit_factor(unit).ok_or_else(|| format!("unknown time unit '{}'", unit))?;

    let seconds = amount
        .checked_mul(factor)
        .and_then(|s| s.checked_mul(sign))
        .ok_or_else(|| "relative time is out of supported range".to_string())?;
    Duration::try_seconds(seconds).ok_or_else(|| "relative time is out of supported range".to_string())
}

fn parse_unix_seconds(arg: &str) -> Option<DateTime<Utc>> {
    if arg.len() < 9 || !arg.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    DateTime::from_timestamp(arg.parse().ok()?, 0)
}

fn parse_local_datetime(arg: &str) -> Option<DateTime<Utc>> {
    const DATETIME_FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ];

    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(arg, format) {
            return from_local(naive);
        }
    }

    ["%Y-%m-%d", "%Y/%m/%d"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(arg, format).ok())
        .and_then(|date| local_midnight(date).ok())
}
