use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    engine::EngineShared,
    error::{Result, SchedulerError},
    payload::JobPayload,
    schedule::initial_next_run,
    telemetry::{self, Dashboard, EngineState},
    types::{
        BatchOperation, BatchReport, CancelOutcome, JobExecution, JobFilter, JobPatch, JobStatus,
        NewJob, ScheduleKind, ScheduledJob,
    },
};

/// Management operations, usable while the engine loop runs.
///
/// Cheap to clone. Every write goes through the same repository the loop
/// reads, and creating, resuming or triggering a job wakes the loop so due
/// work does not wait for the next poll.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<EngineShared>,
}

impl SchedulerHandle {
    pub(crate) fn new(shared: Arc<EngineShared>) -> Self {
        Self { shared }
    }

    /// Validate `new` and persist it as a `scheduled` job.
    pub fn create_job(&self, new: NewJob) -> Result<ScheduledJob> {
        let s = &self.shared;
        let name = new.name.trim().to_string();
        if name.is_empty() {
            return Err(SchedulerError::Validation("name must not be empty".into()));
        }
        let payload = JobPayload::from_parts(&new.job_type, new.job_data)?;
        let timeout_minutes = new
            .timeout_minutes
            .unwrap_or(s.config.default_timeout_minutes);
        check_limits(new.max_runs, timeout_minutes)?;

        let now = s.clock.now();
        let next = initial_next_run(
            s.evaluator.as_ref(),
            new.schedule_kind,
            &new.schedule_expression,
            now,
        )?;

        let id = Uuid::now_v7().to_string();
        let dependencies = self.check_dependencies(&id, new.dependencies)?;

        let job = ScheduledJob {
            id,
            name,
            description: new.description,
            priority: new.priority,
            schedule_kind: new.schedule_kind,
            schedule_expression: new.schedule_expression.trim().to_string(),
            payload,
            status: JobStatus::Scheduled,
            next_run_time: Some(next),
            last_run_time: None,
            run_count: 0,
            max_runs: new.max_runs,
            retry_count: 0,
            max_retries: new.max_retries.unwrap_or(s.config.default_max_retries),
            timeout_minutes,
            dependencies,
            metadata: new.metadata,
            created_by: new.created_by,
            created_at: now,
            updated_at: now,
        };
        s.repo.insert(&job)?;
        info!(
            job_id = %job.id,
            name = %job.name,
            job_type = job.job_type(),
            priority = %job.priority,
            next_run = %next,
            "job created"
        );
        s.wake.notify_one();
        Ok(job)
    }

    /// Apply a partial update. Changing the schedule recomputes `next_run_time`.
    ///
    /// Running jobs are rejected with [`SchedulerError::JobBusy`]; terminal
    /// jobs cannot be modified at all.
    pub fn update_job(&self, id: &str, patch: JobPatch) -> Result<ScheduledJob> {
        let s = &self.shared;
        let mut job = s.repo.get_required(id)?;
        let previous = job.status;
        if previous == JobStatus::Running {
            return Err(SchedulerError::JobBusy { id: id.to_string() });
        }
        if previous.is_terminal() {
            return Err(SchedulerError::Validation(format!(
                "job {id} is {previous} and can no longer be modified"
            )));
        }

        let now = s.clock.now();
        let reschedule = patch.touches_schedule();

        if let Some(name) = patch.name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(SchedulerError::Validation("name must not be empty".into()));
            }
            job.name = name;
        }
        if let Some(description) = patch.description {
            job.description = description;
        }
        if let Some(priority) = patch.priority {
            job.priority = priority;
        }
        if let Some(kind) = patch.schedule_kind {
            job.schedule_kind = kind;
        }
        if let Some(expr) = patch.schedule_expression {
            job.schedule_expression = expr.trim().to_string();
        }
        if let Some(data) = patch.job_data {
            job.payload = JobPayload::from_parts(job.job_type(), data)?;
        }
        if let Some(max_runs) = patch.max_runs {
            job.max_runs = max_runs;
        }
        if let Some(max_retries) = patch.max_retries {
            job.max_retries = max_retries;
            job.retry_count = job.retry_count.min(max_retries);
        }
        if let Some(timeout) = patch.timeout_minutes {
            job.timeout_minutes = timeout;
        }
        check_limits(job.max_runs, job.timeout_minutes)?;
        if let Some(deps) = patch.dependencies {
            job.dependencies = self.check_dependencies(id, deps)?;
        }
        if let Some(metadata) = patch.metadata {
            job.metadata = metadata;
        }

        if reschedule {
            job.next_run_time = Some(initial_next_run(
                s.evaluator.as_ref(),
                job.schedule_kind,
                &job.schedule_expression,
                now,
            )?);
        }
        job.updated_at = now;

        if !s.repo.update_if_status(&job, previous)? {
            // Most likely claimed by the dispatch loop in the meantime.
            return Err(SchedulerError::JobBusy { id: id.to_string() });
        }
        info!(job_id = %id, rescheduled = reschedule, next_run = ?job.next_run_time, "job updated");
        if reschedule {
            s.wake.notify_one();
        }
        Ok(job)
    }

    /// Cancel a job. A running job is signalled to stop (best effort); a job
    /// that is already terminal is left alone and reported as not cancellable.
    pub fn cancel_job(&self, id: &str) -> Result<CancelOutcome> {
        let s = &self.shared;
        let outcome = s.repo.cancel(id, s.clock.now())?;
        match outcome {
            CancelOutcome::Cancelled { previous } => {
                if let Some(token) = s.running.get(id) {
                    token.cancel();
                }
                info!(job_id = %id, %previous, "job cancelled");
            }
            CancelOutcome::NotCancellable { status } => {
                debug!(job_id = %id, %status, "cancel ignored, job already terminal");
            }
        }
        Ok(outcome)
    }

    /// Hold a scheduled job. Its `next_run_time` is kept for resume.
    pub fn pause_job(&self, id: &str) -> Result<ScheduledJob> {
        let job = self.transition(id, &[JobStatus::Scheduled], JobStatus::Paused, |_, _| {})?;
        info!(job_id = %id, "job paused");
        Ok(job)
    }

    /// Release a paused job. A recurring job whose next run passed while it
    /// was paused is moved to its next occurrence after now; a one-time job
    /// keeps its timestamp and therefore runs promptly.
    pub fn resume_job(&self, id: &str) -> Result<ScheduledJob> {
        let evaluator = self.shared.evaluator.clone();
        let job = self.transition(id, &[JobStatus::Paused], JobStatus::Scheduled, |job, now| {
            let overdue = job.next_run_time.map_or(true, |next| next < now);
            if job.schedule_kind == ScheduleKind::Recurring && overdue {
                match evaluator.next_after(&job.schedule_expression, now) {
                    Ok(next) => job.next_run_time = Some(next),
                    Err(e) => {
                        warn!(job_id = %job.id, "keeping stored next run: {e}");
                        job.next_run_time.get_or_insert(now);
                    }
                }
            } else if job.next_run_time.is_none() {
                job.next_run_time = Some(now);
            }
        })?;
        info!(job_id = %id, next_run = ?job.next_run_time, "job resumed");
        self.shared.wake.notify_one();
        Ok(job)
    }

    /// Make a job due immediately. Triggering a paused job also resumes it.
    pub fn trigger_job(&self, id: &str) -> Result<ScheduledJob> {
        let job = self.transition(
            id,
            &[JobStatus::Scheduled, JobStatus::Paused],
            JobStatus::Scheduled,
            |job, now| job.next_run_time = Some(now),
        )?;
        info!(job_id = %id, "job triggered");
        self.shared.wake.notify_one();
        Ok(job)
    }

    pub fn get_job(&self, id: &str) -> Result<ScheduledJob> {
        self.shared.repo.get_required(id)
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ScheduledJob>> {
        self.shared.repo.list(filter)
    }

    /// Execution history of one job, most recent first.
    pub fn job_executions(&self, id: &str, limit: u32) -> Result<Vec<JobExecution>> {
        if !self.shared.repo.exists(id)? {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        self.shared.repo.list_executions(id, limit)
    }

    pub fn dashboard(&self) -> Result<Dashboard> {
        let s = &self.shared;
        let state = if self.is_running() {
            EngineState::Running
        } else {
            EngineState::Stopped
        };
        telemetry::build_dashboard(
            &s.repo,
            state,
            s.running.len(),
            s.config.max_concurrent_jobs,
            s.clock.now(),
        )
    }

    /// Apply `op` to each id independently; one failure never stops the rest.
    pub fn batch(&self, op: BatchOperation, ids: &[String]) -> BatchReport {
        let mut report = BatchReport::default();
        for id in ids {
            let res = match op {
                BatchOperation::Pause => self.pause_job(id).map(|_| ()),
                BatchOperation::Resume => self.resume_job(id).map(|_| ()),
                BatchOperation::Cancel => match self.cancel_job(id) {
                    Ok(CancelOutcome::Cancelled { .. }) => Ok(()),
                    Ok(CancelOutcome::NotCancellable { status }) => Err(SchedulerError::Validation(
                        format!("job {id} is already {status}"),
                    )),
                    Err(e) => Err(e),
                },
            };
            match res {
                Ok(()) => report.successful.push(id.clone()),
                Err(e) => report.failed.push((id.clone(), e.to_string())),
            }
        }
        info!(
            ?op,
            successful = report.successful.len(),
            failed = report.failed.len(),
            "batch operation finished"
        );
        report
    }

    /// Ids of the jobs executing right now.
    pub fn running_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.running.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Whether the dispatch loop is currently running.
    pub fn is_running(&self) -> bool {
        self.shared.is_running.load(Ordering::SeqCst)
    }

    /// Move `id` from one of `from` to `to`, letting `apply` adjust the row.
    ///
    /// `from` narrows the operation; the move itself must still be an edge of
    /// the job state machine (or leave the status as it is).
    fn transition(
        &self,
        id: &str,
        from: &[JobStatus],
        to: JobStatus,
        apply: impl FnOnce(&mut ScheduledJob, chrono::DateTime<chrono::Utc>),
    ) -> Result<ScheduledJob> {
        let s = &self.shared;
        let mut job = s.repo.get_required(id)?;
        let previous = job.status;
        let allowed = previous == to || previous.can_transition_to(to);
        if !from.contains(&previous) || !allowed {
            return Err(SchedulerError::InvalidTransition {
                id: id.to_string(),
                from: previous,
                to,
            });
        }
        let now = s.clock.now();
        job.status = to;
        job.updated_at = now;
        apply(&mut job, now);

        if !s.repo.update_if_status(&job, previous)? {
            let current = s.repo.status_of(id)?.ok_or_else(|| SchedulerError::JobNotFound {
                id: id.to_string(),
            })?;
            return Err(SchedulerError::InvalidTransition {
                id: id.to_string(),
                from: current,
                to,
            });
        }
        Ok(job)
    }

    /// Deduplicate `deps` and check each names another existing job.
    fn check_dependencies(&self, id: &str, deps: Vec<String>) -> Result<Vec<String>> {
        let mut out: Vec<String> = Vec::with_capacity(deps.len());
        for dep in deps {
            let dep = dep.trim().to_string();
            if dep == id {
                return Err(SchedulerError::Validation(format!(
                    "job {id} cannot depend on itself"
                )));
            }
            if out.contains(&dep) {
                continue;
            }
            if !self.shared.repo.exists(&dep)? {
                return Err(SchedulerError::Validation(format!(
                    "dependency {dep:?} does not exist"
                )));
            }
            out.push(dep);
        }
        Ok(out)
    }
}

fn check_limits(max_runs: Option<u32>, timeout_minutes: u32) -> Result<()> {
    if max_runs == Some(0) {
        return Err(SchedulerError::Validation(
            "max_runs must be at least 1 when set".into(),
        ));
    }
    if timeout_minutes == 0 {
        return Err(SchedulerError::Validation(
            "timeout_minutes must be at least 1".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::{Clock, ManualClock}, handler::HandlerRegistry, repository::JobRepository,
        schedule::CronEvaluator, SchedulerEngine,
    };
    use cadence_core::SchedulerConfig;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    fn setup() -> (SchedulerHandle, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()));
        let engine = SchedulerEngine::with_parts(
            JobRepository::in_memory().unwrap(),
            HandlerRegistry::new(),
            SchedulerConfig::default(),
            Arc::new(CronEvaluator),
            clock.clone(),
        );
        (engine.handle(), clock)
    }

    #[test]
    fn create_applies_config_defaults() {
        let (handle, clock) = setup();
        let job = handle
            .create_job(NewJob::recurring("nightly", "cleanup", "0 2 * * *", json!({})))
            .unwrap();
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.timeout_minutes, 60);
        assert_eq!(job.created_by, "system");
        assert_eq!(job.next_run_time, Some(clock.now() + Duration::hours(18)));
        assert_eq!(handle.get_job(&job.id).unwrap().name, "nightly");
    }

    #[test]
    fn create_rejects_bad_input() {
        let (handle, clock) = setup();
        let past = NewJob::once("p", "noop", clock.now() - Duration::minutes(1), json!({}));
        assert_eq!(handle.create_job(past).unwrap_err().code(), "VALIDATION_ERROR");

        let bad_cron = NewJob::recurring("c", "noop", "* * *", json!({}));
        assert!(handle.create_job(bad_cron).is_err());

        let missing_dep = NewJob::recurring("d", "noop", "* * * * *", json!({}))
            .with_dependencies(vec!["ghost".into()]);
        assert!(handle.create_job(missing_dep).is_err());

        let zero_runs = NewJob::recurring("z", "noop", "* * * * *", json!({})).with_max_runs(0);
        assert!(handle.create_job(zero_runs).is_err());

        assert!(handle.list_jobs(&JobFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn update_recomputes_next_run() {
        let (handle, clock) = setup();
        let job = handle
            .create_job(NewJob::recurring("r", "noop", "0 * * * *", json!({})))
            .unwrap();
        assert_eq!(job.next_run_time, Some(clock.now() + Duration::hours(1)));

        let patch = JobPatch {
            schedule_expression: Some("*/15 * * * *".into()),
            ..JobPatch::default()
        };
        let updated = handle.update_job(&job.id, patch).unwrap();
        assert_eq!(updated.next_run_time, Some(clock.now() + Duration::minutes(15)));
        assert_eq!(
            handle.get_job(&job.id).unwrap().next_run_time,
            updated.next_run_time
        );
    }

    #[test]
    fn created_job_matches_stored_row() {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap() + Duration::nanoseconds(123_456_789);
        let clock = Arc::new(ManualClock::new(start));
        let engine = SchedulerEngine::with_parts(
            JobRepository::in_memory().unwrap(),
            HandlerRegistry::new(),
            SchedulerConfig::default(),
            Arc::new(CronEvaluator),
            clock.clone(),
        );
        let handle = engine.handle();

        let created = handle
            .create_job(NewJob::new(
                "precise",
                "noop",
                ScheduleKind::OneTime,
                "2026-03-02T09:00:00.987654321Z",
                json!({}),
            ))
            .unwrap();
        let stored = handle.get_job(&created.id).unwrap();
        assert_eq!(stored.created_at, created.created_at);
        assert_eq!(stored.updated_at, created.updated_at);
        assert_eq!(stored.next_run_time, created.next_run_time);

        let patch = JobPatch {
            schedule_expression: Some("2026-03-02T10:00:00.000000500Z".into()),
            ..JobPatch::default()
        };
        let updated = handle.update_job(&created.id, patch).unwrap();
        let stored = handle.get_job(&created.id).unwrap();
        assert_eq!(stored.next_run_time, updated.next_run_time);
        assert_eq!(stored.updated_at, updated.updated_at);
    }

    #[test]
    fn update_of_self_dependency_is_rejected() {
        let (handle, _) = setup();
        let job = handle
            .create_job(NewJob::recurring("r", "noop", "0 * * * *", json!({})))
            .unwrap();
        let patch = JobPatch {
            dependencies: Some(vec![job.id.clone()]),
            ..JobPatch::default()
        };
        assert!(handle.update_job(&job.id, patch).is_err());
    }

    #[test]
    fn pause_resume_trigger() {
        let (handle, clock) = setup();
        let job = handle
            .create_job(NewJob::recurring("r", "noop", "0 9 * * *", json!({})))
            .unwrap();

        let paused = handle.pause_job(&job.id).unwrap();
        assert_eq!(paused.status, JobStatus::Paused);
        assert!(matches!(
            handle.pause_job(&job.id),
            Err(SchedulerError::InvalidTransition { .. })
        ));

        // Sleep through the 09:00 run; resume moves to the next day.
        clock.advance(Duration::hours(3));
        let resumed = handle.resume_job(&job.id).unwrap();
        assert_eq!(resumed.status, JobStatus::Scheduled);
        assert_eq!(
            resumed.next_run_time,
            Some(Utc.with_ymd_and_hms(2026, 3, 3, 9, 0, 0).unwrap())
        );

        handle.pause_job(&job.id).unwrap();
        let triggered = handle.trigger_job(&job.id).unwrap();
        assert_eq!(triggered.status, JobStatus::Scheduled);
        assert_eq!(triggered.next_run_time, Some(clock.now()));
    }

    #[test]
    fn transition_follows_state_machine_edges() {
        let (handle, _) = setup();
        let job = handle
            .create_job(NewJob::recurring("r", "noop", "0 * * * *", json!({})))
            .unwrap();
        let err = handle
            .transition(&job.id, &[JobStatus::Scheduled], JobStatus::Completed, |_, _| {})
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { to: JobStatus::Completed, .. }));
        assert_eq!(handle.get_job(&job.id).unwrap().status, JobStatus::Scheduled);
    }

    #[test]
    fn cancel_then_modify_fails() {
        let (handle, _) = setup();
        let job = handle
            .create_job(NewJob::recurring("r", "noop", "0 * * * *", json!({})))
            .unwrap();
        assert_eq!(
            handle.cancel_job(&job.id).unwrap(),
            CancelOutcome::Cancelled { previous: JobStatus::Scheduled }
        );
        assert_eq!(
            handle.cancel_job(&job.id).unwrap(),
            CancelOutcome::NotCancellable { status: JobStatus::Cancelled }
        );
        assert!(handle.trigger_job(&job.id).is_err());
        assert!(handle.update_job(&job.id, JobPatch::default()).is_err());
    }

    #[test]
    fn batch_reports_each_id() {
        let (handle, _) = setup();
        let a = handle
            .create_job(NewJob::recurring("a", "noop", "0 * * * *", json!({})))
            .unwrap();
        let b = handle
            .create_job(NewJob::recurring("b", "noop", "0 * * * *", json!({})))
            .unwrap();
        handle.pause_job(&b.id).unwrap();

        let report = handle.batch(
            BatchOperation::Pause,
            &[a.id.clone(), b.id.clone(), "nope".into()],
        );
        assert_eq!(report.successful, vec![a.id.clone()]);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[1].0, "nope");
    }

    #[test]
    fn history_of_unknown_job_is_not_found() {
        let (handle, _) = setup();
        assert!(matches!(
            handle.job_executions("nope", 10),
            Err(SchedulerError::JobNotFound { .. })
        ));
    }
}
