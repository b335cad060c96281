//! Five-field cron expressions: `minute hour day-of-month month day-of-week`.
//!
//! Each field accepts `*`, single values, ranges (`1-5`), steps (`*/15`,
//! `10-40/10`, `5/20`) and comma lists of any of those. Months and weekdays
//! also accept three-letter names; weekday `7` is Sunday. When both
//! day-of-month and day-of-week are restricted a day matches if either does,
//! as in classic cron. `@hourly`, `@daily`, `@weekly`, `@monthly` and
//! `@yearly` are accepted as shorthands.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Utc};
use thiserror::Error;

/// Searching further than this without a match means the expression can never fire
/// (e.g. `0 0 30 2 *`).
const SEARCH_HORIZON_YEARS: i32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronParseError {
    #[error("cron expression must have 5 fields, got {0}")]
    FieldCount(usize),
    #[error("invalid {field} field {value:?}: {reason}")]
    Field {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("unknown cron shorthand {0:?}")]
    Shorthand(String),
}

/// Allowed values of one field, as a bitmask over `min..=max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    bits: u64,
    /// The field was `*` (or a step over the full range starting at `*`).
    wildcard: bool,
}

impl FieldSet {
    fn contains(&self, v: u32) -> bool {
        self.bits & (1u64 << v) != 0
    }
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[] };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[] };
const DAY: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[] };
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &["jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec"],
};
// 7 is folded onto 0 (Sunday) after parsing.
const WEEKDAY: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &["sun", "mon", "tue", "wed", "thu", "fri", "sat"],
};

impl FieldSpec {
    fn err(&self, value: &str, reason: impl Into<String>) -> CronParseError {
        CronParseError::Field {
            field: self.name,
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    fn value(&self, raw: &str, whole: &str) -> Result<u32, CronParseError> {
        let lower = raw.to_ascii_lowercase();
        if let Some(pos) = self.names.iter().position(|n| *n == lower) {
            // month names start at 1, weekday names at 0
            return Ok(pos as u32 + self.min);
        }
        let v: u32 = raw
            .parse()
            .map_err(|_| self.err(whole, format!("{raw:?} is not a number")))?;
        if v < self.min || v > self.max {
            return Err(self.err(whole, format!("{v} outside {}-{}", self.min, self.max)));
        }
        Ok(v)
    }

    fn parse(&self, field: &str) -> Result<FieldSet, CronParseError> {
        if field.is_empty() {
            return Err(self.err(field, "empty"));
        }
        let mut bits = 0u64;
        let mut wildcard = false;

        for item in field.split(',') {
            let (range, step) = match item.split_once('/') {
                Some((r, s)) => {
                    let step: u32 = s
                        .parse()
                        .map_err(|_| self.err(field, format!("bad step {s:?}")))?;
                    if step == 0 {
                        return Err(self.err(field, "step must be at least 1"));
                    }
                    (r, step)
                }
                None => (item, 1),
            };

            let (lo, hi) = if range == "*" {
                if step == 1 {
                    wildcard = true;
                }
                (self.min, self.max)
            } else if let Some((a, b)) = range.split_once('-') {
                let (lo, hi) = (self.value(a, field)?, self.value(b, field)?);
                if lo > hi {
                    return Err(self.err(field, format!("range {lo}-{hi} is reversed")));
                }
                (lo, hi)
            } else {
                let v = self.value(range, field)?;
                // `5/20` means "from 5 to the end, every 20"
                if step > 1 {
                    (v, self.max)
                } else {
                    (v, v)
                }
            };

            let mut v = lo;
            while v <= hi {
                bits |= 1u64 << v;
                v += step;
            }
        }
        Ok(FieldSet { bits, wildcard })
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: FieldSet,
    hour: FieldSet,
    day: FieldSet,
    month: FieldSet,
    weekday: FieldSet,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronParseError> {
        let expr = expr.trim();
        let expanded = match expr {
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            "@yearly" | "@annually" => "0 0 1 1 *",
            s if s.starts_with('@') => return Err(CronParseError::Shorthand(s.to_string())),
            s => s,
        };

        let parts: Vec<&str> = expanded.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronParseError::FieldCount(parts.len()));
        }

        let mut weekday = WEEKDAY.parse(parts[4])?;
        if weekday.contains(7) {
            weekday.bits = (weekday.bits & !(1 << 7)) | 1;
        }

        Ok(Self {
            minute: MINUTE.parse(parts[0])?,
            hour: HOUR.parse(parts[1])?,
            day: DAY.parse(parts[2])?,
            month: MONTH.parse(parts[3])?,
            weekday,
        })
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.day.contains(date.day());
        let dow = self.weekday.contains(date.weekday().num_days_from_sunday());
        match (self.day.wildcard, self.weekday.wildcard) {
            (true, true) => true,
            (true, false) => dow,
            (false, true) => dom,
            (false, false) => dom || dow,
        }
    }

    /// Check if the expression matches the given minute.
    pub fn matches(&self, time: &DateTime<Utc>) -> bool {
        self.month.contains(time.month())
            && self.day_matches(time.date_naive())
            && self.hour.contains(time.hour())
            && self.minute.contains(time.minute())
    }

    /// The first matching minute strictly after `after`.
    ///
    /// Returns `None` when nothing matches within the search horizon, which
    /// only happens for impossible dates such as February 30th.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.naive_utc().with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let horizon = start.year() + SEARCH_HORIZON_YEARS;
        let mut t: NaiveDateTime = start;

        while t.year() <= horizon {
            if !self.month.contains(t.month()) {
                t = first_of_next_month(t.date())?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hour.contains(t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minute.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t.and_utc());
        }
        None
    }
}

impl std::str::FromStr for CronExpr {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpr::parse(s)
    }
}

fn first_of_next_month(d: NaiveDate) -> Option<NaiveDate> {
    if d.month() == 12 {
        NaiveDate::from_ymd_opt(d.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(d.year(), d.month() + 1, 1)
    }
}

/// Common schedules by plain-language description.
pub const PRESETS: &[(&str, &str)] = &[
    ("every minute", "* * * * *"),
    ("every hour", "0 * * * *"),
    ("every day", "0 0 * * *"),
    ("every day at 9am", "0 9 * * *"),
    ("every week", "0 0 * * 0"),
    ("every month", "0 0 1 * *"),
    ("weekdays at 9am", "0 9 * * 1-5"),
    ("weekends at 10am", "0 10 * * 6,0"),
];

/// Daily at midnight; used when a description has no preset.
pub const DEFAULT_PRESET: &str = "0 0 * * *";

/// Look up a cron expression for a plain-language description (case-insensitive).
pub fn preset_for(description: &str) -> (&'static str, bool) {
    let wanted = description.trim().to_lowercase();
    PRESETS
        .iter()
        .find(|(desc, _)| *desc == wanted)
        .map(|(_, expr)| (*expr, true))
        .unwrap_or((DEFAULT_PRESET, false))
}
