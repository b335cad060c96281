use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cadence_core::SchedulerConfig;
use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    clock::{Clock, SystemClock},
    error::Result,
    handle::SchedulerHandle,
    handler::HandlerRegistry,
    repository::JobRepository,
    runner::{JobRunner, RetryPolicy},
    schedule::{self, ScheduleEvaluator},
    telemetry,
    types::{ExecutionStatus, JobExecution, JobStatus, ScheduledJob},
};

/// Minimum number of ready rows read per query while filling free slots.
const READY_PAGE_SIZE: usize = 32;

/// State shared by the dispatch loop, its runner tasks and every [`SchedulerHandle`].
pub(crate) struct EngineShared {
    pub(crate) repo: JobRepository,
    pub(crate) runner: JobRunner,
    pub(crate) evaluator: Arc<dyn ScheduleEvaluator>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: SchedulerConfig,
    /// One permit per concurrency slot; a runner task holds its permit until it exits.
    pub(crate) slots: Arc<Semaphore>,
    /// Cancellation tokens of jobs currently executing, keyed by job id.
    pub(crate) running: DashMap<String, CancellationToken>,
    /// Parent of every job token; fired when the shutdown grace period runs out.
    pub(crate) root_token: CancellationToken,
    /// Nudges the loop to dispatch before the next poll tick.
    pub(crate) wake: Notify,
    pub(crate) is_running: AtomicBool,
}

/// The dispatch loop: one coordinator task that fills free concurrency slots
/// with ready, dependency-satisfied jobs, highest priority first, and hands
/// each one to a [`JobRunner`] on its own task.
pub struct SchedulerEngine {
    shared: Arc<EngineShared>,
}

impl SchedulerEngine {
    /// Engine on the wall clock with the evaluator chosen by `config`.
    pub fn new(repo: JobRepository, registry: HandlerRegistry, config: SchedulerConfig) -> Self {
        let evaluator = schedule::from_config(&config);
        Self::with_parts(repo, registry, config, evaluator, Arc::new(SystemClock))
    }

    pub fn with_parts(
        repo: JobRepository,
        registry: HandlerRegistry,
        config: SchedulerConfig,
        evaluator: Arc<dyn ScheduleEvaluator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let runner = JobRunner::new(
            repo.clone(),
            Arc::new(registry),
            evaluator.clone(),
            clock.clone(),
            RetryPolicy::from_config(&config),
        );
        let slots = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self {
            shared: Arc::new(EngineShared {
                repo,
                runner,
                evaluator,
                clock,
                config,
                slots,
                running: DashMap::new(),
                root_token: CancellationToken::new(),
                wake: Notify::new(),
                is_running: AtomicBool::new(false),
            }),
        }
    }

    /// Management handle sharing this engine's store, clock and running set.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle::new(self.shared.clone())
    }

    /// Number of jobs executing right now.
    pub fn active_jobs(&self) -> usize {
        self.shared.running.len()
    }

    /// Main loop. Runs until `shutdown` broadcasts `true`, then drains.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let s = &self.shared;
        s.is_running.store(true, Ordering::SeqCst);
        info!(
            max_concurrent_jobs = s.config.max_concurrent_jobs,
            poll_interval_secs = s.config.poll_interval_secs,
            evaluator = s.evaluator.name(),
            "scheduler engine started"
        );

        if let Err(e) = s.repo.recover_interrupted(s.clock.now()) {
            error!("restart recovery failed: {e}");
        }

        let mut poll = tokio::time::interval(s.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut housekeeping = tokio::time::interval(s.config.housekeeping_interval());
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut snapshot = tokio::time::interval(s.config.snapshot_interval());
        snapshot.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut outage_delay: Option<Duration> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = poll.tick() => self.dispatch_cycle(&mut outage_delay, &mut shutdown).await,
                _ = s.wake.notified() => self.dispatch_cycle(&mut outage_delay, &mut shutdown).await,
                _ = housekeeping.tick() => self.spawn_housekeeping(),
                _ = snapshot.tick() => self.spawn_snapshot(),
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("scheduler engine shutting down");
        self.drain().await;
        s.is_running.store(false, Ordering::SeqCst);
        info!("scheduler engine stopped");
    }

    /// Run one dispatch cycle. Returns the number of jobs handed to runners.
    ///
    /// The ready queue is read page by page until every free slot is taken
    /// or the queue is exhausted, so jobs blocked on a dependency never hide
    /// runnable jobs further down. Errors local to one job are logged and that
    /// job is skipped; only a store outage is returned.
    pub async fn tick(&self) -> Result<usize> {
        let s = &self.shared;
        if s.slots.available_permits() == 0 {
            debug!("all slots busy, skipping dispatch cycle");
            return Ok(0);
        }

        let now = s.clock.now();
        let page_size = s.config.max_concurrent_jobs.max(READY_PAGE_SIZE);
        let mut offset = 0;
        let mut admitted = 0;
        loop {
            let page = s.repo.list_ready_page(now, page_size, offset)?;
            // Admitted jobs leave the ready set; everything else keeps its place.
            let mut kept = page.scanned - page.jobs.len();
            for job in page.jobs {
                if s.slots.available_permits() == 0 {
                    return Ok(admitted);
                }
                let job_id = job.id.clone();
                match self.admit(job) {
                    Ok(true) => admitted += 1,
                    Ok(false) => kept += 1,
                    Err(e) if e.is_store_outage() => return Err(e),
                    Err(e) => {
                        kept += 1;
                        error!(%job_id, "dispatch failed: {e}");
                    }
                }
            }
            if page.scanned < page_size {
                return Ok(admitted);
            }
            offset += kept;
        }
    }

    /// Wait until every runner task has released its slot.
    pub async fn wait_idle(&self) {
        let all = self.shared.config.max_concurrent_jobs.max(1) as u32;
        if let Ok(permits) = self.shared.slots.acquire_many(all).await {
            drop(permits);
        }
    }

    fn dependencies_met(&self, job: &ScheduledJob) -> Result<bool> {
        for dep in &job.dependencies {
            if self.shared.repo.status_of(dep)? != Some(JobStatus::Completed) {
                debug!(job_id = %job.id, dependency = %dep, "dependency not completed yet");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Claim `job`, open its execution and spawn its runner.
    fn admit(&self, mut job: ScheduledJob) -> Result<bool> {
        let s = &self.shared;
        if !self.dependencies_met(&job)? {
            return Ok(false);
        }
        let Ok(permit) = s.slots.clone().try_acquire_owned() else {
            return Ok(false);
        };

        let now = s.clock.now();
        if !s.repo.claim(&job.id, now)? {
            // Paused, cancelled or triggered elsewhere since the fetch.
            return Ok(false);
        }

        let execution = JobExecution {
            id: Uuid::now_v7().to_string(),
            job_id: job.id.clone(),
            status: ExecutionStatus::Running,
            start_time: now,
            end_time: None,
            result: None,
            error_message: None,
            logs: Vec::new(),
        };
        if let Err(e) = s.repo.insert_execution(&execution) {
            // Give the claim back so the job is not stranded in `running`.
            if let Err(undo) = s.repo.update_if_status(&job, JobStatus::Running) {
                error!(job_id = %job.id, "could not release claim: {undo}");
            }
            return Err(e);
        }

        job.status = JobStatus::Running;
        job.last_run_time = Some(now);

        let token = s.root_token.child_token();
        s.running.insert(job.id.clone(), token.clone());

        info!(
            job_id = %job.id,
            execution_id = %execution.id,
            job_type = job.job_type(),
            priority = %job.priority,
            "job dispatched"
        );

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let job_id = job.id.clone();
            let execution_id = execution.id.clone();
            if let Err(e) = shared.runner.run(job, execution, token).await {
                error!(%job_id, %execution_id, "failed to record job outcome: {e}");
            }
            shared.running.remove(&job_id);
            drop(permit);
        });
        Ok(true)
    }

    async fn dispatch_cycle(
        &self,
        outage_delay: &mut Option<Duration>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        match self.tick().await {
            Ok(n) => {
                if outage_delay.take().is_some() {
                    info!("job store reachable again");
                }
                if n > 0 {
                    debug!(admitted = n, "dispatch cycle finished");
                }
            }
            Err(e) if e.is_store_outage() => {
                let max = self.shared.config.store_retry_max();
                let delay = outage_delay
                    .map(|d| (d * 2).min(max))
                    .unwrap_or(Duration::from_secs(1).min(max));
                *outage_delay = Some(delay);
                warn!(retry_in_secs = delay.as_secs_f64(), "job store unavailable: {e}");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(e) => error!("dispatch cycle failed: {e}"),
        }
    }

    fn spawn_housekeeping(&self) {
        let repo = self.shared.repo.clone();
        let retention = ChronoDuration::days(i64::from(self.shared.config.retention_days));
        let cutoff = self.shared.clock.now() - retention;
        tokio::task::spawn_blocking(move || {
            if let Err(e) = repo.prune_executions(cutoff) {
                error!("execution pruning failed: {e}");
            }
            if let Err(e) = repo.prune_snapshots(cutoff) {
                error!("snapshot pruning failed: {e}");
            }
        });
    }

    fn spawn_snapshot(&self) {
        let repo = self.shared.repo.clone();
        let active = self.active_jobs();
        let now = self.shared.clock.now();
        tokio::task::spawn_blocking(move || {
            match telemetry::take_snapshot(&repo, active, now).and_then(|snap| repo.insert_snapshot(&snap)) {
                Ok(()) => debug!(active, "resource snapshot recorded"),
                Err(e) => warn!("resource snapshot failed: {e}"),
            }
        });
    }

    /// Give in-flight jobs the grace period, then cancel what is left.
    async fn drain(&self) {
        let s = &self.shared;
        let in_flight = s.running.len();
        if in_flight == 0 {
            return;
        }
        let grace = s.config.shutdown_grace();
        info!(in_flight, grace_secs = grace.as_secs(), "waiting for running jobs");
        if tokio::time::timeout(grace, self.wait_idle()).await.is_ok() {
            return;
        }

        warn!(remaining = s.running.len(), "grace period elapsed, cancelling running jobs");
        s.root_token.cancel();
        if tokio::time::timeout(grace, self.wait_idle()).await.is_err() {
            warn!(
                remaining = s.running.len(),
                "jobs ignored cancellation; they will be recovered on next start"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, handler::JobContext, payload::JobPayload, types::NewJob};
    use chrono::Utc;
    use serde_json::json;

    fn engine(registry: HandlerRegistry) -> (SchedulerEngine, Arc<ManualClock>) {
        engine_on(JobRepository::in_memory().unwrap(), registry)
    }

    fn engine_on(repo: JobRepository, registry: HandlerRegistry) -> (SchedulerEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let config = SchedulerConfig {
            max_concurrent_jobs: 2,
            ..SchedulerConfig::default()
        };
        let engine = SchedulerEngine::with_parts(
            repo,
            registry,
            config,
            Arc::new(schedule::CronEvaluator),
            clock.clone(),
        );
        (engine, clock)
    }

    #[tokio::test]
    async fn nothing_due_admits_nothing() {
        let (engine, clock) = engine(HandlerRegistry::new());
        let handle = engine.handle();
        handle
            .create_job(NewJob::once("later", "noop", clock.now() + ChronoDuration::hours(1), json!({})))
            .unwrap();
        assert_eq!(engine.tick().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn due_job_runs_to_completion() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("noop", |_c: JobContext, _p: JobPayload| async move { Ok(json!("done")) });
        let (engine, clock) = engine(registry);
        let handle = engine.handle();
        let job = handle
            .create_job(NewJob::once("soon", "noop", clock.now() + ChronoDuration::minutes(1), json!({})))
            .unwrap();

        clock.advance(ChronoDuration::minutes(2));
        assert_eq!(engine.tick().await.unwrap(), 1);
        engine.wait_idle().await;

        let stored = handle.get_job(&job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(engine.active_jobs(), 0);
    }

    #[tokio::test]
    async fn shutdown_drains_and_stops() {
        let (engine, _clock) = engine(HandlerRegistry::new());
        let handle = engine.handle();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(rx));
        tokio::task::yield_now().await;
        tx.send(true).unwrap();
        task.await.unwrap();
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn storage_error_on_one_job_does_not_stop_the_cycle() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER reject_broken BEFORE INSERT ON job_executions
             WHEN (SELECT name FROM jobs WHERE id = NEW.job_id) = 'broken'
             BEGIN SELECT RAISE(ABORT, 'execution rejected'); END;",
        )
        .unwrap();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("noop", |_c: JobContext, _p: JobPayload| async move { Ok(json!(null)) });
        let (engine, clock) = engine_on(JobRepository::new(conn).unwrap(), registry);
        let handle = engine.handle();

        let due = clock.now() + ChronoDuration::minutes(1);
        let broken = handle
            .create_job(
                NewJob::once("broken", "noop", due, json!({}))
                    .with_priority(crate::types::JobPriority::Critical),
            )
            .unwrap();
        let fine = handle.create_job(NewJob::once("fine", "noop", due, json!({}))).unwrap();

        clock.advance(ChronoDuration::minutes(2));
        assert_eq!(engine.tick().await.unwrap(), 1);
        engine.wait_idle().await;

        assert_eq!(handle.get_job(&fine.id).unwrap().status, JobStatus::Completed);
        let broken = handle.get_job(&broken.id).unwrap();
        assert_eq!(broken.status, JobStatus::Scheduled);
        assert!(broken.next_run_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn store_outage_backs_off_exponentially() {
        let (engine, _clock) = engine(HandlerRegistry::new());
        engine.shared.repo.poison();

        let err = engine.tick().await.unwrap_err();
        assert!(err.is_store_outage());

        let (_tx, mut rx) = watch::channel(false);
        let mut delay = None;
        let started = tokio::time::Instant::now();
        engine.dispatch_cycle(&mut delay, &mut rx).await;
        assert_eq!(delay, Some(Duration::from_secs(1)));
        engine.dispatch_cycle(&mut delay, &mut rx).await;
        assert_eq!(delay, Some(Duration::from_secs(2)));
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn store_outage_wait_ends_on_shutdown() {
        let (engine, _clock) = engine(HandlerRegistry::new());
        engine.shared.repo.poison();

        let (tx, mut rx) = watch::channel(false);
        let mut delay = Some(Duration::from_secs(100));
        let started = tokio::time::Instant::now();
        let cycle = engine.dispatch_cycle(&mut delay, &mut rx);
        tx.send(true).unwrap();
        cycle.await;
        assert!(started.elapsed() < Duration::from_secs(200));
        assert_eq!(delay, Some(Duration::from_secs(200)));
    }
}
