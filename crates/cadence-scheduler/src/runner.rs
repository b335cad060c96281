use std::sync::Arc;

use cadence_core::SchedulerConfig;
use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    error::{Result, SchedulerError},
    handler::{HandlerRegistry, JobContext},
    repository::JobRepository,
    schedule::ScheduleEvaluator,
    types::{ExecutionStatus, JobExecution, JobStatus, ScheduleKind, ScheduledJob},
};

/// Exponential backoff between retries of a failing job.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_secs: u64,
    max_secs: u64,
}

impl RetryPolicy {
    pub fn new(base_secs: u64, max_secs: u64) -> Self {
        Self {
            base_secs,
            max_secs,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.backoff_base_secs, config.backoff_max_secs)
    }

    /// Delay before the next attempt once `retry_count` failures have been counted:
    /// `min(base * 2^retry_count, max)`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let secs = 2u64
            .checked_pow(retry_count)
            .and_then(|factor| self.base_secs.checked_mul(factor))
            .unwrap_or(self.max_secs)
            .min(self.max_secs);
        Duration::seconds(secs as i64)
    }
}

/// How one attempt ended, before it is written back.
#[derive(Debug)]
enum Outcome {
    Succeeded(serde_json::Value),
    Failed(String),
    TimedOut(u32),
    /// The cancellation token fired: a manual cancel or shutdown.
    Interrupted,
}

/// Executes one claimed job and reconciles its state.
#[derive(Clone)]
pub struct JobRunner {
    repo: JobRepository,
    registry: Arc<HandlerRegistry>,
    evaluator: Arc<dyn ScheduleEvaluator>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl JobRunner {
    pub fn new(
        repo: JobRepository,
        registry: Arc<HandlerRegistry>,
        evaluator: Arc<dyn ScheduleEvaluator>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            repo,
            registry,
            evaluator,
            clock,
            retry,
        }
    }

    /// Run `job`, which the dispatch loop has already moved to `running` and
    /// for which `execution` is open.
    ///
    /// Cancellation through `cancel` is best effort: the handler future is
    /// dropped at its next await point, but code that never yields keeps
    /// running until it returns.
    pub async fn run(
        &self,
        mut job: ScheduledJob,
        mut execution: JobExecution,
        cancel: CancellationToken,
    ) -> Result<()> {
        let job_type = job.job_type().to_string();

        let Some(handler) = self.registry.resolve(&job_type) else {
            // Retrying cannot fix a missing registration.
            let reason = format!("no handler registered for job type {job_type:?}");
            error!(job_id = %job.id, execution_id = %execution.id, %job_type, "{reason}");
            let now = self.clock.now();
            job.status = JobStatus::Failed;
            job.next_run_time = None;
            job.updated_at = now;
            let closed = self.close(&mut execution, ExecutionStatus::Failed, None, Some(reason), Vec::new(), now);
            return self.finish(&job, closed);
        };

        let ctx = JobContext::new(
            job.id.clone(),
            execution.id.clone(),
            job.retry_count + 1,
            cancel.clone(),
        );
        let limit = std::time::Duration::from_secs(u64::from(job.timeout_minutes) * 60);

        debug!(job_id = %job.id, execution_id = %execution.id, %job_type, attempt = ctx.attempt, "handler started");
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Interrupted,
            res = tokio::time::timeout(limit, handler.run(&ctx, &job.payload)) => match res {
                Ok(Ok(value)) => Outcome::Succeeded(value),
                Ok(Err(e)) => Outcome::Failed(format!("{e:#}")),
                Err(_) => {
                    // Tell a handler that spawned its own work to stop.
                    cancel.cancel();
                    Outcome::TimedOut(job.timeout_minutes)
                }
            },
        };

        let now = self.clock.now();
        let logs = ctx.take_logs();
        job.last_run_time = Some(execution.start_time);
        job.updated_at = now;

        let closed = match outcome {
            Outcome::Succeeded(value) => {
                self.on_success(&mut job, now);
                self.close(&mut execution, ExecutionStatus::Completed, Some(value), None, logs, now)
            }
            Outcome::Failed(reason) => {
                self.on_failure(&mut job, &reason, now);
                self.close(&mut execution, ExecutionStatus::Failed, None, Some(reason), logs, now)
            }
            Outcome::TimedOut(minutes) => {
                let reason = format!("timed out after {minutes} minutes");
                self.on_failure(&mut job, &reason, now);
                self.close(&mut execution, ExecutionStatus::TimedOut, None, Some(reason), logs, now)
            }
            Outcome::Interrupted => {
                // A manual cancel has already written `cancelled`, so the
                // conditional write below is a no-op. Otherwise this is a
                // shutdown and the job goes back to the queue untouched.
                job.status = JobStatus::Scheduled;
                job.next_run_time = Some(now);
                warn!(job_id = %job.id, execution_id = %execution.id, %job_type, "job interrupted");
                let reason = "cancelled while running".to_string();
                self.close(&mut execution, ExecutionStatus::Cancelled, None, Some(reason), logs, now)
            }
        };

        self.finish(&job, closed)
    }

    /// Write the job back whether or not its execution could be closed, so a
    /// failed execution update never strands the job in `running`. The first
    /// error wins.
    fn finish(&self, job: &ScheduledJob, closed: Result<()>) -> Result<()> {
        let written = self.write_back(job);
        if let (Err(close_err), Err(write_err)) = (&closed, &written) {
            error!(job_id = %job.id, "closing execution failed ({close_err}), job write-back failed too: {write_err}");
        }
        closed.and(written)
    }

    fn on_success(&self, job: &mut ScheduledJob, now: DateTime<Utc>) {
        job.run_count += 1;
        job.retry_count = 0;

        let more_runs = job.schedule_kind == ScheduleKind::Recurring
            && job.max_runs.map_or(true, |max| job.run_count < max);
        if !more_runs {
            job.status = JobStatus::Completed;
            job.next_run_time = None;
            info!(job_id = %job.id, job_type = job.job_type(), run_count = job.run_count, "job completed");
            return;
        }

        match self.evaluator.next_after(&job.schedule_expression, now) {
            Ok(next) => {
                job.status = JobStatus::Scheduled;
                job.next_run_time = Some(next);
                info!(job_id = %job.id, job_type = job.job_type(), run_count = job.run_count, next_run = %next, "recurring job rescheduled");
            }
            Err(e) => {
                error!(job_id = %job.id, "cannot compute next run, failing job: {e}");
                job.status = JobStatus::Failed;
                job.next_run_time = None;
            }
        }
    }

    fn on_failure(&self, job: &mut ScheduledJob, reason: &str, now: DateTime<Utc>) {
        job.retry_count = (job.retry_count + 1).min(job.max_retries);
        if job.retries_left() {
            let delay = self.retry.backoff(job.retry_count);
            job.status = JobStatus::Scheduled;
            job.next_run_time = Some(now + delay);
            warn!(
                job_id = %job.id,
                job_type = job.job_type(),
                retry_count = job.retry_count,
                max_retries = job.max_retries,
                backoff_secs = delay.num_seconds(),
                "job failed, retry scheduled: {reason}"
            );
        } else {
            job.status = JobStatus::Failed;
            job.next_run_time = None;
            error!(
                job_id = %job.id,
                job_type = job.job_type(),
                retry_count = job.retry_count,
                "job failed permanently: {reason}"
            );
        }
    }

    fn close(
        &self,
        execution: &mut JobExecution,
        status: ExecutionStatus,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
        logs: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        execution.status = status;
        execution.end_time = Some(now);
        execution.result = result;
        execution.error_message = error_message;
        execution.logs.extend(logs);
        self.repo.update_execution(execution)?;
        debug!(execution_id = %execution.id, job_id = %execution.job_id, %status, "execution closed");
        Ok(())
    }

    /// Persist the job unless it left `running` behind our back.
    fn write_back(&self, job: &ScheduledJob) -> Result<()> {
        if !JobStatus::Running.can_transition_to(job.status) {
            return Err(SchedulerError::InvalidTransition {
                id: job.id.clone(),
                from: JobStatus::Running,
                to: job.status,
            });
        }
        if !self.repo.update_if_status(job, JobStatus::Running)? {
            info!(job_id = %job.id, "job changed state while running, keeping stored state");
        }
        Ok(())
    }
}
