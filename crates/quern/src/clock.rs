//! Wall-clock helpers. All persisted timestamps are UTC ISO-8601 with a
//! trailing `Z`; scheduling arithmetic uses integer epoch seconds.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Current time as seconds since the Unix epoch.
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// Current time formatted as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn now_iso() -> String {
    Utc::now().format(ISO_FORMAT).to_string()
}

/// Format an epoch timestamp as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn to_iso(ts: i64) -> String {
    match Utc.timestamp_opt(ts, 0) {
        chrono::LocalResult::Single(dt) => dt.format(ISO_FORMAT).to_string(),
        _ => String::new(),
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid run-at datetime `{0}`, expected ISO-8601 such as 2026-01-05T15:30:00Z")]
pub struct TimeParseError(pub String);

/// Parse a scheduled-run timestamp into epoch seconds.
///
/// Accepts RFC 3339 (`2026-01-05T15:30:00Z` or with a numeric offset) and
/// naive variants with either a `T` or a space separator; naive times are
/// taken as UTC.
pub fn parse_run_at(s: &str) -> Result<i64, TimeParseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp());
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(Utc.from_utc_datetime(&naive).timestamp());
        }
    }
    Err(TimeParseError(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_with_z() {
        assert_eq!(parse_run_at("2026-01-01T00:00:00Z").unwrap(), 1_767_225_600);
    }

    #[test]
    fn parses_numeric_offset() {
        assert_eq!(
            parse_run_at("2026-01-01T01:00:00+01:00").unwrap(),
            1_767_225_600
        );
    }

    #[test]
    fn naive_forms_are_utc() {
        assert_eq!(parse_run_at("2026-01-01T00:00:00").unwrap(), 1_767_225_600);
        assert_eq!(parse_run_at("2026-01-01 00:00:00").unwrap(), 1_767_225_600);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_run_at("next tuesday").is_err());
        assert!(parse_run_at("").is_err());
    }

    #[test]
    fn iso_round_trip() {
        let iso = to_iso(1_767_225_600);
        assert_eq!(iso, "2026-01-01T00:00:00Z");
        assert_eq!(parse_run_at(&iso).unwrap(), 1_767_225_600);
    }
}
