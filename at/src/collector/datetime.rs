//! Lenient timestamp parsing for feed entries
//!
//! Feeds in the wild mix RFC 822 dates, RFC 3339 dates, bare epochs and
//! a handful of locale-common patterns. Total failure is represented as
//! `None`; callers fall back to the fetch time.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%d %b %Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d %b %Y", "%d.%m.%Y"];

/// Parse a timestamp in any of the supported shapes
pub fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    // RFC 2822 covers the RSS pubDate shape ("Tue, 01 Jul 2025 08:30:00 GMT")
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }

    // RFC 3339 covers Atom updated/published
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    // Bare epoch seconds or milliseconds
    if s.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(n) = s.parse::<i64>() {
            let seconds = if s.len() >= 13 { n / 1000 } else { n };
            if let Some(dt) = DateTime::from_timestamp(seconds, 0) {
                return Some(dt);
            }
        }
    }

    // Locale-common naive patterns, treated as UTC
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }

    // Last resort: an ISO-shaped date embedded in surrounding prose
    // ("Published 2025-07-01 by ...")
    if let Some(found) = embedded_date().find(s)
        && found.as_str() != s
    {
        return parse_datetime(found.as_str());
    }

    None
}

fn embedded_date() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2}(?:[T ]\d{2}:\d{2}(?::\d{2})?)?").expect("static date pattern")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_rfc2822() {
        let dt = parse_datetime("Tue, 01 Jul 2025 08:30:00 GMT").unwrap();
        assert_eq!(dt.year(), 2025);
        assert_eq!(dt.month(), 7);
        assert_eq!(dt.hour(), 8);
    }

    #[test]
    fn test_rfc2822_with_offset() {
        let dt = parse_datetime("Tue, 01 Jul 2025 08:30:00 +0200").unwrap();
        assert_eq!(dt.hour(), 6);
    }

    #[test]
    fn test_rfc3339() {
        let dt = parse_datetime("2025-07-01T08:30:00Z").unwrap();
        assert_eq!(dt.day(), 1);
        assert_eq!(dt.minute(), 30);
    }

    #[test]
    fn test_epoch_seconds() {
        let dt = parse_datetime("1751356200").unwrap();
        assert_eq!(dt.year(), 2025);
    }

    #[test]
    fn test_epoch_millis() {
        let dt = parse_datetime("1751356200000").unwrap();
        assert_eq!(dt.year(), 2025);
    }

    #[test]
    fn test_naive_datetime() {
        let dt = parse_datetime("2025-07-01 08:30:00").unwrap();
        assert_eq!(dt.hour(), 8);
    }

    #[test]
    fn test_bare_date() {
        let dt = parse_datetime("2025-07-01").unwrap();
        assert_eq!(dt.hour(), 0);
        assert_eq!(dt.day(), 1);
    }

    #[test]
    fn test_date_embedded_in_prose() {
        let dt = parse_datetime("Published 2025-07-01 by the editors").unwrap();
        assert_eq!((dt.year(), dt.month(), dt.day()), (2025, 7, 1));

        let dt = parse_datetime("Updated: 2025-07-01 08:30 UTC").unwrap();
        assert_eq!(dt.hour(), 8);
        assert_eq!(dt.minute(), 30);
    }

    #[test]
    fn test_garbage_is_none() {
        assert!(parse_datetime("next tuesday").is_none());
        assert!(parse_datetime("").is_none());
        assert!(parse_datetime("   ").is_none());
    }
}
