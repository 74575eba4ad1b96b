//! Crontab schedules for deletion windows
//!
//! A [`Schedule`] is a duty cycle based on a traditional five-field crontab
//! expression (minute, hour, day-of-month, month, day-of-week), parsed once
//! into per-field bitsets. Matching is always evaluated in UTC, regardless of
//! the host timezone.

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::{Error, Result};

// Top bit records that the field was written as a star.
const STAR_BIT: u64 = 1 << 63;

/// A crontab duty cycle stored as one bitset per field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    second: u64,
    minute: u64,
    hour: u64,
    dom: u64,
    month: u64,
    dow: u64,
    source: String,
}

/// Acceptable values for one field, plus a name table where conventional
/// crontab accepts names (months and weekdays)
struct Bounds {
    min: u32,
    max: u32,
    names: &'static [(&'static str, u32)],
}

const MINUTES: Bounds = Bounds {
    min: 0,
    max: 59,
    names: &[],
};
const HOURS: Bounds = Bounds {
    min: 0,
    max: 23,
    names: &[],
};
const DOM: Bounds = Bounds {
    min: 1,
    max: 31,
    names: &[],
};
const MONTHS: Bounds = Bounds {
    min: 1,
    max: 12,
    names: &[
        ("jan", 1),
        ("feb", 2),
        ("mar", 3),
        ("apr", 4),
        ("may", 5),
        ("jun", 6),
        ("jul", 7),
        ("aug", 8),
        ("sep", 9),
        ("oct", 10),
        ("nov", 11),
        ("dec", 12),
    ],
};
const DOW: Bounds = Bounds {
    min: 0,
    max: 6,
    names: &[
        ("sun", 0),
        ("mon", 1),
        ("tue", 2),
        ("wed", 3),
        ("thu", 4),
        ("fri", 5),
        ("sat", 6),
    ],
};

impl Schedule {
    /// Parse a standard five-field crontab expression
    ///
    /// Fields are minute, hour, day-of-month, month, day-of-week. Lists
    /// (`a,b`), ranges (`a-b`), steps (`a-b/n`, `*/n`), and three-letter
    /// names for months and weekdays are accepted.
    pub fn parse(spec: &str) -> Result<Schedule> {
        let fields: Vec<&str> = spec.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::config(
                "cron",
                format!("expected 5 fields in '{}', got {}", spec, fields.len()),
            ));
        }
        Ok(Schedule {
            // Second granularity exists only for uniformity of matching;
            // a five-field expression always matches every second.
            second: bit_range(0, 59, 1) | STAR_BIT,
            minute: parse_field(fields[0], &MINUTES)?,
            hour: parse_field(fields[1], &HOURS)?,
            dom: parse_field(fields[2], &DOM)?,
            month: parse_field(fields[3], &MONTHS)?,
            dow: parse_field(fields[4], &DOW)?,
            source: spec.to_string(),
        })
    }

    /// The string this schedule was parsed from
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the given UTC instant falls inside the schedule
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        let month_matches = 1u64 << t.month() & self.month != 0;
        let hour_matches = 1u64 << t.hour() & self.hour != 0;
        let minute_matches = 1u64 << t.minute() & self.minute != 0;
        let second_matches = 1u64 << t.second() & self.second != 0;

        month_matches && self.day_matches(t) && hour_matches && minute_matches && second_matches
    }

    // When either day field was written as a star, both restrict the day;
    // otherwise matching either one is enough. Traditional crontab keeps
    // this asymmetry and so do we.
    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom_match = 1u64 << t.day() & self.dom != 0;
        let dow_match = 1u64 << t.weekday().num_days_from_sunday() & self.dow != 0;

        if self.dom & STAR_BIT != 0 || self.dow & STAR_BIT != 0 {
            dom_match && dow_match
        } else {
            dom_match || dow_match
        }
    }
}

fn parse_field(field: &str, bounds: &Bounds) -> Result<u64> {
    let mut bits = 0u64;
    for expr in field.split(',') {
        bits |= parse_range(expr, bounds)?;
    }
    Ok(bits)
}

fn parse_range(expr: &str, bounds: &Bounds) -> Result<u64> {
    let (range, step_str) = match expr.split_once('/') {
        Some((r, s)) => (r, Some(s)),
        None => (expr, None),
    };

    let (start, end, starred) = if range == "*" {
        (bounds.min, bounds.max, true)
    } else if let Some((lo, hi)) = range.split_once('-') {
        (parse_value(lo, bounds)?, parse_value(hi, bounds)?, false)
    } else {
        let v = parse_value(range, bounds)?;
        // "N/step" means "N through max, stepping"
        let end = if step_str.is_some() { bounds.max } else { v };
        (v, end, false)
    };

    let step = match step_str {
        None => 1,
        Some(s) => s
            .parse::<u32>()
            .ok()
            .filter(|s| *s > 0)
            .ok_or_else(|| Error::config("cron", format!("invalid step in '{}'", expr)))?,
    };

    if start < bounds.min || end > bounds.max || start > end {
        return Err(Error::config(
            "cron",
            format!(
                "'{}' out of range {}-{}",
                expr, bounds.min, bounds.max
            ),
        ));
    }

    // An explicit step discards the star marker: "*/2" restricts the day
    // fields like any other enumeration.
    let mut bits = if starred && step_str.is_none() {
        STAR_BIT
    } else {
        0
    };
    let mut v = start;
    while v <= end {
        bits |= 1 << v;
        v += step;
    }
    Ok(bits)
}

fn parse_value(s: &str, bounds: &Bounds) -> Result<u32> {
    let lower = s.to_ascii_lowercase();
    if let Some((_, v)) = bounds.names.iter().find(|(name, _)| *name == lower) {
        return Ok(*v);
    }
    s.parse::<u32>()
        .map_err(|_| Error::config("cron", format!("invalid field value '{}'", s)))
}

fn bit_range(min: u32, max: u32, step: u32) -> u64 {
    let mut bits = 0u64;
    let mut v = min;
    while v <= max {
        bits |= 1 << v;
        v += step;
    }
    bits
}
