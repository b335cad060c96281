//! Builders shared by unit tests.

use chrono::{DateTime, Utc};

use crate::{
    payload::JobPayload,
    schedule::{initial_next_run, CronEvaluator},
    types::{JobStatus, NewJob, ScheduledJob},
};

/// Materialise a request the way the handle does, with fixed defaults and an
/// id derived from the name.
pub(crate) fn job_from(new: NewJob, now: DateTime<Utc>) -> ScheduledJob {
    let next = initial_next_run(&CronEvaluator, new.schedule_kind, &new.schedule_expression, now)
        .unwrap();
    ScheduledJob {
        id: format!("job-{}", new.name),
        payload: JobPayload::from_parts(&new.job_type, new.job_data).unwrap(),
        name: new.name,
        description: new.description,
        priority: new.priority,
        schedule_kind: new.schedule_kind,
        schedule_expression: new.schedule_expression,
        status: JobStatus::Scheduled,
        next_run_time: Some(next),
        last_run_time: None,
        run_count: 0,
        max_runs: new.max_runs,
        retry_count: 0,
        max_retries: new.max_retries.unwrap_or(3),
        timeout_minutes: new.timeout_minutes.unwrap_or(60),
        dependencies: new.dependencies,
        metadata: new.metadata,
        created_by: new.created_by,
        created_at: now,
        updated_at: now,
    }
}
