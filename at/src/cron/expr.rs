//! Five-field cron expressions
//!
//! `minute hour day-of-month month day-of-week` with `*`, `*/N`, `A-B`,
//! `A,B,C` and the aliases `@yearly @monthly @weekly @daily @hourly`.
//! Nothing else parses; in particular `@every` is rejected. Evaluation
//! is timezone-aware and `next_fire` is a pure function of
//! (expression, instant, timezone).

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;

/// Parse errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronError {
    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),

    #[error("unknown alias: {0}")]
    UnknownAlias(String),

    #[error("invalid {field} field: {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("unknown job: {0}")]
    UnknownJob(String),
}

/// One parsed field as a bitmask over its value range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CronField {
    /// Whether the field was written `*` (matters for day semantics)
    any: bool,
    mask: u64,
}

impl CronField {
    fn contains(&self, value: u32) -> bool {
        self.mask >> value & 1 == 1
    }
}

fn parse_field(spec: &str, field: &'static str, min: u32, max: u32) -> Result<CronField, CronError> {
    let invalid = || CronError::InvalidField {
        field,
        value: spec.to_string(),
    };

    if spec == "*" {
        let mut mask = 0u64;
        for v in min..=max {
            mask |= 1 << v;
        }
        return Ok(CronField { any: true, mask });
    }

    if let Some(step) = spec.strip_prefix("*/") {
        let step: u32 = step.parse().map_err(|_| invalid())?;
        if step == 0 || step > max {
            return Err(invalid());
        }
        let mut mask = 0u64;
        let mut v = min;
        while v <= max {
            mask |= 1 << v;
            v += step;
        }
        return Ok(CronField { any: false, mask });
    }

    let mut mask = 0u64;
    for part in spec.split(',') {
        if let Some((start, end)) = part.split_once('-') {
            let start: u32 = start.parse().map_err(|_| invalid())?;
            let end: u32 = end.parse().map_err(|_| invalid())?;
            if start < min || end > max || start > end {
                return Err(invalid());
            }
            for v in start..=end {
                mask |= 1 << v;
            }
        } else {
            let v: u32 = part.parse().map_err(|_| invalid())?;
            // Day-of-week 7 is the other spelling of Sunday
            let v = if field == "day-of-week" && v == 7 { 0 } else { v };
            if v < min || v > max {
                return Err(invalid());
            }
            mask |= 1 << v;
        }
    }
    if mask == 0 {
        return Err(invalid());
    }
    Ok(CronField { any: false, mask })
}

/// A parsed, validated cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
    source: String,
}

impl CronExpr {
    /// Parse an expression or alias
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let trimmed = expression.trim();

        let expanded = if let Some(alias) = trimmed.strip_prefix('@') {
            match alias {
                "yearly" => "0 0 1 1 *",
                "monthly" => "0 0 1 * *",
                "weekly" => "0 0 * * 0",
                "daily" => "0 0 * * *",
                "hourly" => "0 * * * *",
                _ => return Err(CronError::UnknownAlias(trimmed.to_string())),
            }
        } else {
            trimmed
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        Ok(Self {
            minute: parse_field(fields[0], "minute", 0, 59)?,
            hour: parse_field(fields[1], "hour", 0, 23)?,
            day_of_month: parse_field(fields[2], "day-of-month", 1, 31)?,
            month: parse_field(fields[3], "month", 1, 12)?,
            day_of_week: parse_field(fields[4], "day-of-week", 0, 6)?,
            source: trimmed.to_string(),
        })
    }

    /// The expression as written
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether a local civil time matches
    fn matches_naive(&self, dt: &chrono::NaiveDateTime) -> bool {
        if !self.minute.contains(dt.minute())
            || !self.hour.contains(dt.hour())
            || !self.month.contains(dt.month())
        {
            return false;
        }

        let dom = self.day_of_month.contains(dt.day());
        let dow = self.day_of_week.contains(dt.weekday().num_days_from_sunday());

        // Standard cron day semantics: when both day fields are
        // restricted, either may match; otherwise both must
        if !self.day_of_month.any && !self.day_of_week.any {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Smallest future instant matching the expression, in UTC
    ///
    /// Sub-minute instants round up to the next minute boundary. DST
    /// gaps skip nonexistent local times; ambiguous local times map to
    /// the earliest UTC instant.
    pub fn next_fire(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local_after = after.with_timezone(&tz).naive_local();
        let seconds_into_minute = local_after.second() as i64;
        let mut candidate = local_after + chrono::Duration::seconds(60 - seconds_into_minute);
        candidate = candidate.with_second(0).unwrap_or(candidate).with_nanosecond(0).unwrap_or(candidate);

        // Bounded search: a year of minutes covers every expression
        let max_checks = 366 * 24 * 60;
        for _ in 0..max_checks {
            if self.matches_naive(&candidate) {
                match tz.from_local_datetime(&candidate) {
                    chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                    chrono::LocalResult::Ambiguous(earliest, _) => return Some(earliest.with_timezone(&Utc)),
                    chrono::LocalResult::None => {
                        // DST gap, this local minute does not exist
                    }
                }
            }
            candidate += chrono::Duration::minutes(1);
        }
        None
    }
}

/// Parse a timezone name, falling back to UTC
pub fn parse_tz(name: &str) -> Tz {
    name.parse::<Tz>().unwrap_or(chrono_tz::UTC)
}
