use std::sync::Arc;

use cadence_core::{EvaluatorKind, SchedulerConfig};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use tracing::warn;

use crate::{
    cron::CronExpr,
    error::{Result, SchedulerError},
    types::ScheduleKind,
};

/// Computes when a recurring job fires next.
///
/// One-time jobs never go through an evaluator: their next run is the literal
/// timestamp in the schedule expression.
pub trait ScheduleEvaluator: Send + Sync {
    /// Short name for logs and the dashboard.
    fn name(&self) -> &'static str;

    /// Reject an expression that could never be scheduled.
    fn validate(&self, expr: &str) -> Result<()>;

    /// The next firing strictly after `after`.
    fn next_after(&self, expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>>;
}

/// Full five-field cron evaluation.
#[derive(Debug, Default, Clone, Copy)]
pub struct CronEvaluator;

impl ScheduleEvaluator for CronEvaluator {
    fn name(&self) -> &'static str {
        "cron"
    }

    fn validate(&self, expr: &str) -> Result<()> {
        let cron = parse_cron(expr)?;
        // A syntactically valid expression can still name a date that never
        // exists (`0 0 30 2 *`); such a job would sit in `scheduled` forever.
        if cron.next_after(&Utc::now()).is_none() {
            return Err(SchedulerError::Validation(format!(
                "cron expression {expr:?} never fires"
            )));
        }
        Ok(())
    }

    fn next_after(&self, expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        parse_cron(expr)?.next_after(&after).ok_or_else(|| {
            SchedulerError::Validation(format!("cron expression {expr:?} never fires"))
        })
    }
}

/// Degraded mode: every recurring job fires a fixed interval after the
/// previous evaluation, whatever its expression says.
///
/// Expressions are still syntax-checked so switching back to
/// [`CronEvaluator`] never meets a job it cannot parse.
#[derive(Debug, Clone, Copy)]
pub struct FixedIntervalEvaluator {
    interval: Duration,
}

impl FixedIntervalEvaluator {
    pub fn new(interval: std::time::Duration) -> Self {
        let interval = Duration::from_std(interval).unwrap_or_else(|_| Duration::hours(1));
        Self { interval }
    }
}

impl ScheduleEvaluator for FixedIntervalEvaluator {
    fn name(&self) -> &'static str {
        "fixed_interval"
    }

    fn validate(&self, expr: &str) -> Result<()> {
        parse_cron(expr).map(|_| ())
    }

    fn next_after(&self, expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.validate(expr)?;
        Ok(after + self.interval)
    }
}

/// Build the evaluator selected by `scheduler.evaluator`.
pub fn from_config(config: &SchedulerConfig) -> Arc<dyn ScheduleEvaluator> {
    match config.evaluator {
        EvaluatorKind::Cron => Arc::new(CronEvaluator),
        EvaluatorKind::FixedInterval => {
            warn!(
                interval_secs = config.fallback_interval_secs,
                "cron evaluation disabled; recurring jobs fire on a fixed interval"
            );
            Arc::new(FixedIntervalEvaluator::new(std::time::Duration::from_secs(
                config.fallback_interval_secs,
            )))
        }
    }
}

fn parse_cron(expr: &str) -> Result<CronExpr> {
    CronExpr::parse(expr).map_err(|e| SchedulerError::Validation(e.to_string()))
}

/// Parse the timestamp of a one-time schedule.
///
/// Accepts RFC 3339 (`2026-05-01T09:00:00Z`, any offset) and naive ISO 8601
/// (`2026-05-01T09:00:00`, `2026-05-01 09:00`), the latter read as UTC.
pub fn parse_one_time(expr: &str) -> Result<DateTime<Utc>> {
    let expr = expr.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(expr) {
        return Ok(dt.with_timezone(&Utc));
    }
    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ];
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(expr, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| {
            SchedulerError::Validation(format!("invalid one-time timestamp {expr:?}"))
        })
}

/// Validate a schedule and compute the first `next_run_time` for it.
///
/// One-time timestamps must lie strictly after `now`; recurring expressions
/// must be accepted by `evaluator`.
pub fn initial_next_run(
    evaluator: &dyn ScheduleEvaluator,
    kind: ScheduleKind,
    expr: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    match kind {
        ScheduleKind::OneTime => {
            let at = parse_one_time(expr)?;
            if at <= now {
                return Err(SchedulerError::Validation(format!(
                    "one-time schedule {expr:?} is not in the future"
                )));
            }
            Ok(crate::clock::truncate_micros(at))
        }
        ScheduleKind::Recurring => {
            evaluator.validate(expr)?;
            evaluator.next_after(expr, now)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 10, h, m, 0).unwrap()
    }

    #[test]
    fn one_time_must_be_in_the_future() {
        let now = at(12, 0);
        let ok = initial_next_run(&CronEvaluator, ScheduleKind::OneTime, "2026-04-10T13:00:00Z", now)
            .unwrap();
        assert_eq!(ok, at(13, 0));

        let err = initial_next_run(&CronEvaluator, ScheduleKind::OneTime, "2026-04-10T12:00:00Z", now)
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(initial_next_run(&CronEvaluator, ScheduleKind::OneTime, "tomorrow", now).is_err());
    }

    #[test]
    fn naive_and_offset_timestamps() {
        assert_eq!(parse_one_time("2026-04-10T13:00:00").unwrap(), at(13, 0));
        assert_eq!(parse_one_time("2026-04-10 13:00").unwrap(), at(13, 0));
        assert_eq!(parse_one_time("2026-04-10T15:00:00+02:00").unwrap(), at(13, 0));
    }

    #[test]
    fn recurring_uses_evaluator() {
        let next =
            initial_next_run(&CronEvaluator, ScheduleKind::Recurring, "30 * * * *", at(12, 31))
                .unwrap();
        assert_eq!(next, at(13, 30));
        assert!(initial_next_run(&CronEvaluator, ScheduleKind::Recurring, "61 * * * *", at(12, 0))
            .is_err());
        assert!(CronEvaluator.validate("0 0 30 2 *").is_err());
    }

    #[test]
    fn fixed_interval_ignores_expression_but_checks_syntax() {
        let eval = FixedIntervalEvaluator::new(std::time::Duration::from_secs(3600));
        assert_eq!(eval.next_after("*/5 * * * *", at(12, 7)).unwrap(), at(13, 7));
        assert!(eval.next_after("not cron", at(12, 7)).is_err());
    }

    #[test]
    fn config_selects_evaluator() {
        let mut config = SchedulerConfig::default();
        assert_eq!(from_config(&config).name(), "cron");
        config.evaluator = EvaluatorKind::FixedInterval;
        assert_eq!(from_config(&config).name(), "fixed_interval");
    }
}
