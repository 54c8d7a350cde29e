use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

/// Formats accepted for naive (zone-less) modification times, assumed UTC.
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

/// Parse a modification time from a JSON value.
/// Supports:
/// - integers (seconds or milliseconds since epoch, picked by magnitude)
/// - numeric strings (same rule as integers)
/// - RFC3339 strings
/// - `yyyy-MM-dd HH:mm:ss[.ffffff]` strings (assumed UTC)
pub fn parse_modification_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(from_epoch),
        Value::String(s) => parse_timestamp_str(s),
        _ => None,
    }
}

pub fn parse_timestamp_str(timestamp_str: &str) -> Option<DateTime<Utc>> {
    let trimmed = timestamp_str.trim();

    if let Ok(ts) = trimmed.parse::<i64>() {
        return from_epoch(ts);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    NAIVE_FORMATS.iter().find_map(|fmt| {
        NaiveDateTime::parse_from_str(trimmed, fmt)
            .ok()
            .map(|naive| naive.and_utc())
    })
}

// 10-digit values are seconds, anything larger is already milliseconds
fn from_epoch(ts: i64) -> Option<DateTime<Utc>> {
    if ts < 0 {
        return None;
    }
    if ts < 10_000_000_000 {
        Utc.timestamp_opt(ts, 0).single()
    } else {
        Utc.timestamp_millis_opt(ts).single()
    }
}
