//! The request descriptor: what a single run asks for.

use std::path::PathBuf;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use tracing::warn;

use crate::{error::ValidationError, persist::StoreFormat};

/// Inclusive range of timestamps, keeping the labels the user typed.
#[derive(Debug, Clone, PartialEq)]
pub struct DateRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub start_label: String,
    pub end_label: String,
}

impl DateRange {
    pub fn parse(start: &str, end: &str) -> Result<Self, ValidationError> {
        let range = DateRange {
            start: parse_timestamp(start)?,
            end: parse_timestamp(end)?,
            start_label: start.trim().to_string(),
            end_label: end.trim().to_string(),
        };

        if range.start > range.end {
            return Err(ValidationError::EmptyRange {
                start: range.start_label,
                end: range.end_label,
            });
        }

        Ok(range)
    }

    pub fn contains(&self, t: &NaiveDateTime) -> bool {
        *t >= self.start && *t <= self.end
    }

    /// Every year touched by the range.
    pub fn years(&self) -> std::ops::RangeInclusive<i32> {
        self.start.year()..=self.end.year()
    }
}

/// Accepts `YYYY`, `YYYY-MM-DD` and `YYYY-MM-DD[T ]HH:MM[:SS]`.
pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime, ValidationError> {
    let s = s.trim();

    if s.len() == 4 {
        if let Ok(year) = s.parse::<i32>() {
            if let Some(d) = NaiveDate::from_ymd_opt(year, 1, 1) {
                return Ok(d.and_time(NaiveTime::MIN));
            }
        }
    }

    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(d.and_time(NaiveTime::MIN));
    }

    for fmt in [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(t);
        }
    }

    Err(ValidationError::Date(s.to_string()))
}

/// Time granularity used for bucketing fetches and flooring timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Hourly,
    Daily,
    Yearly,
}

impl Frequency {
    pub fn floor(&self, t: NaiveDateTime) -> NaiveDateTime {
        match self {
            Frequency::Hourly => t.date().and_hms_opt(t.hour(), 0, 0).unwrap_or(t),
            Frequency::Daily => t.date().and_time(NaiveTime::MIN),
            Frequency::Yearly => NaiveDate::from_ymd_opt(t.year(), 1, 1)
                .map(|d| d.and_time(NaiveTime::MIN))
                .unwrap_or(t),
        }
    }

    fn next(&self, t: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            Frequency::Hourly => t.checked_add_signed(Duration::hours(1)),
            Frequency::Daily => t.checked_add_signed(Duration::days(1)),
            Frequency::Yearly => NaiveDate::from_ymd_opt(t.year() + 1, 1, 1)
                .map(|d| d.and_time(NaiveTime::MIN)),
        }
    }

    /// Bucket starts covering `range`, both ends included.
    pub fn buckets(&self, range: &DateRange) -> Vec<NaiveDateTime> {
        let mut out = Vec::new();
        let mut t = self.floor(range.start);
        if t < range.start {
            t = match self.next(t) {
                Some(t) => t,
                None => return out,
            };
        }

        while t <= range.end {
            out.push(t);
            t = match self.next(t) {
                Some(n) => n,
                None => break,
            };
        }

        out
    }

    pub fn label(&self) -> &'static str {
        match self {
            Frequency::Hourly => "hourly",
            Frequency::Daily => "daily",
            Frequency::Yearly => "yearly",
        }
    }
}

/// Splits a comma separated list and keeps the names found in `allowed`.
///
/// An empty list means `defaults`. Unknown names are skipped with a warning.
pub fn parse_variables(raw: &str, allowed: &[&str], defaults: &[&str], source: &str) -> Vec<String> {
    let names: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    if names.is_empty() {
        return defaults.iter().map(|s| s.to_string()).collect();
    }

    let mut out: Vec<String> = Vec::new();
    for name in names {
        if !allowed.contains(&name) {
            warn!("{} is not a valid {} variable. Skipping...", name, source);
            continue;
        }
        if !out.iter().any(|v| v == name) {
            out.push(name.to_string());
        }
    }

    out
}

/// Validates a single choice, falling back to `default` when it is absent or unknown.
pub fn choose<'a>(value: Option<&str>, allowed: &[&'a str], default: &'a str, what: &str) -> &'a str {
    match value {
        None => default,
        Some(v) => match allowed.iter().find(|a| **a == v.trim()) {
            Some(a) => *a,
            None => {
                warn!("{} is not a valid {}. Using {} instead", v, what, default);
                default
            }
        },
    }
}

/// Everything a run needs, resolved from the command line once.
#[derive(Debug, Clone)]
pub struct Request {
    pub range: DateRange,
    pub frequency: Frequency,
    pub variables: Vec<String>,
    pub output_dir: PathBuf,
    pub boundary: Option<PathBuf>,
    pub scratch_dir: PathBuf,
    pub format: StoreFormat,
}

// -- Tests -------------------------------------------------------------------
