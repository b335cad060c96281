use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use crate::{
    db::{init_db, parse_ts, ts, ts_opt},
    error::{Result, SchedulerError},
    payload::JobPayload,
    telemetry::ResourceSnapshot,
    types::{
        CancelOutcome, ExecutionStatus, JobExecution, JobFilter, JobPriority, JobStatus,
        ScheduleKind, ScheduledJob,
    },
};

const JOB_COLUMNS: &str = "id, name, description, job_type, priority, schedule_kind,
    schedule_expression, job_data, status, next_run_time, last_run_time, run_count,
    max_runs, retry_count, max_retries, timeout_minutes, dependencies, metadata,
    created_by, created_at, updated_at";

const EXECUTION_COLUMNS: &str =
    "id, job_id, status, start_time, end_time, result, error_message, logs";

/// A slice of the ready queue returned by [`JobRepository::list_ready_page`].
#[derive(Debug, Default)]
pub struct ReadyPage {
    pub jobs: Vec<ScheduledJob>,
    /// Rows read, including undecodable ones that were skipped.
    pub scanned: usize,
}

/// Durable storage for job definitions, execution records and resource snapshots.
///
/// Cheap to clone: every clone shares one SQLite connection behind a mutex.
/// Each method touches a single job's row (or a single execution), so callers
/// never need cross-job locking.
#[derive(Clone)]
pub struct JobRepository {
    conn: Arc<Mutex<Connection>>,
}

impl JobRepository {
    /// Wrap `conn`, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Fresh in-memory store, mostly for tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SchedulerError::StorePoisoned)
    }

    /// Poison the connection mutex, making every later call a store outage.
    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let conn = self.conn.clone();
        let _ = std::thread::spawn(move || {
            let _guard = conn.lock();
            panic!("store poisoned on purpose");
        })
        .join();
    }

    // --- job definitions ---------------------------------------------------

    pub fn insert(&self, job: &ScheduledJob) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO jobs ({JOB_COLUMNS})
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)"
            ),
            params![
                job.id,
                job.name,
                job.description,
                job.job_type(),
                job.priority.rank(),
                job.schedule_kind.to_string(),
                job.schedule_expression,
                serde_json::to_string(&job.payload.data())?,
                job.status.as_str(),
                ts_opt(job.next_run_time),
                ts_opt(job.last_run_time),
                job.run_count,
                job.max_runs,
                job.retry_count,
                job.max_retries,
                job.timeout_minutes,
                serde_json::to_string(&job.dependencies)?,
                serde_json::to_string(&job.metadata)?,
                job.created_by,
                ts(job.created_at),
                ts(job.updated_at),
            ],
        )?;
        debug!(job_id = %job.id, job_type = job.job_type(), "job row inserted");
        Ok(())
    }

    /// Replace every mutable column of `job`'s row.
    pub fn update(&self, job: &ScheduledJob) -> Result<()> {
        let conn = self.lock()?;
        let n = Self::write_row(&conn, job, None)?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: job.id.clone() });
        }
        Ok(())
    }

    /// Replace `job`'s row only if its persisted status is still `expected`.
    ///
    /// Returns false when someone else moved the job first (e.g. a cancel landed
    /// while the job was running). The check and the write are one statement.
    pub fn update_if_status(&self, job: &ScheduledJob, expected: JobStatus) -> Result<bool> {
        let conn = self.lock()?;
        Ok(Self::write_row(&conn, job, Some(expected))? > 0)
    }

    fn write_row(conn: &Connection, job: &ScheduledJob, expected: Option<JobStatus>) -> Result<usize> {
        let n = conn.execute(
            "UPDATE jobs SET
                name = ?1, description = ?2, job_type = ?3, priority = ?4,
                schedule_kind = ?5, schedule_expression = ?6, job_data = ?7,
                status = ?8, next_run_time = ?9, last_run_time = ?10,
                run_count = ?11, max_runs = ?12, retry_count = ?13,
                max_retries = ?14, timeout_minutes = ?15, dependencies = ?16,
                metadata = ?17, updated_at = ?18
             WHERE id = ?19 AND (?20 IS NULL OR status = ?20)",
            params![
                job.name,
                job.description,
                job.job_type(),
                job.priority.rank(),
                job.schedule_kind.to_string(),
                job.schedule_expression,
                serde_json::to_string(&job.payload.data())?,
                job.status.as_str(),
                ts_opt(job.next_run_time),
                ts_opt(job.last_run_time),
                job.run_count,
                job.max_runs,
                job.retry_count,
                job.max_retries,
                job.timeout_minutes,
                serde_json::to_string(&job.dependencies)?,
                serde_json::to_string(&job.metadata)?,
                ts(job.updated_at),
                job.id,
                expected.map(JobStatus::as_str),
            ],
        )?;
        Ok(n)
    }

    /// Atomically move a due job from `scheduled` to `running`.
    ///
    /// Returns false if the job is no longer `scheduled` (paused, cancelled or
    /// claimed by an earlier cycle), so it can never be dispatched twice.
    pub fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let now = ts(now);
        let n = conn.execute(
            "UPDATE jobs SET status = 'running', last_run_time = ?1, updated_at = ?1
             WHERE id = ?2 AND status = 'scheduled'",
            params![now, id],
        )?;
        Ok(n == 1)
    }

    pub fn get(&self, id: &str) -> Result<Option<ScheduledJob>> {
        let conn = self.lock()?;
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Like [`get`](Self::get) but a missing row is an error.
    pub fn get_required(&self, id: &str) -> Result<ScheduledJob> {
        self.get(id)?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM jobs WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn status_of(&self, id: &str) -> Result<Option<JobStatus>> {
        let conn = self.lock()?;
        let status: Option<String> = conn
            .query_row("SELECT status FROM jobs WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        status
            .map(|s| {
                s.parse()
                    .map_err(|e: String| SchedulerError::Validation(format!("stored row {id}: {e}")))
            })
            .transpose()
    }

    /// Jobs due at `now`, highest priority first, then oldest due time.
    pub fn list_ready(&self, now: DateTime<Utc>, capacity: usize) -> Result<Vec<ScheduledJob>> {
        Ok(self.list_ready_page(now, capacity, 0)?.jobs)
    }

    /// One page of the ready queue, in the same order as [`Self::list_ready`].
    ///
    /// A row that cannot be decoded is logged and left out of `jobs` so it
    /// cannot hold up the rest of the queue; it still counts in `scanned`.
    pub fn list_ready_page(&self, now: DateTime<Utc>, limit: usize, offset: usize) -> Result<ReadyPage> {
        let mut page = ReadyPage::default();
        if limit == 0 {
            return Ok(page);
        }
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE status = 'scheduled' AND next_run_time IS NOT NULL AND next_run_time <= ?1
             ORDER BY priority DESC, next_run_time ASC, created_at ASC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(params![ts(now), limit as i64, offset as i64], |row| {
            Ok((row.get::<_, String>(0)?, row_to_job(row)))
        })?;
        for row in rows {
            let (id, decoded) = row?;
            page.scanned += 1;
            match decoded {
                Ok(job) => page.jobs.push(job),
                Err(e) => warn!(job_id = %id, "skipping undecodable job row: {e}"),
            }
        }
        Ok(page)
    }

    /// Filtered, paginated listing in dispatch order.
    pub fn list(&self, filter: &JobFilter) -> Result<Vec<ScheduledJob>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR job_type = ?2)
             ORDER BY priority DESC, next_run_time ASC, created_at ASC
             LIMIT ?3 OFFSET ?4"
        ))?;
        let jobs = stmt
            .query_map(
                params![
                    filter.status.map(JobStatus::as_str),
                    filter.job_type,
                    filter.limit,
                    filter.offset,
                ],
                row_to_job,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Scheduled jobs due on or before `until`, soonest first.
    pub fn upcoming(&self, until: DateTime<Utc>, limit: u32) -> Result<Vec<ScheduledJob>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE status = 'scheduled' AND next_run_time IS NOT NULL AND next_run_time <= ?1
             ORDER BY next_run_time ASC
             LIMIT ?2"
        ))?;
        let jobs = stmt
            .query_map(params![ts(until), limit], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Move a non-terminal job to `cancelled`. Terminal jobs are left untouched.
    pub fn cancel(&self, id: &str, now: DateTime<Utc>) -> Result<CancelOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let status: Option<String> = tx
            .query_row("SELECT status FROM jobs WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        let Some(status) = status else {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        };
        let previous: JobStatus = status
            .parse()
            .map_err(|e: String| SchedulerError::Validation(format!("stored row {id}: {e}")))?;

        if previous.is_terminal() {
            return Ok(CancelOutcome::NotCancellable { status: previous });
        }

        tx.execute(
            "UPDATE jobs SET status = 'cancelled', next_run_time = NULL, updated_at = ?1
             WHERE id = ?2",
            params![ts(now), id],
        )?;
        tx.commit()?;
        Ok(CancelOutcome::Cancelled { previous })
    }

    pub fn counts_by_status(&self) -> Result<BTreeMap<String, u64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
        Ok(counts)
    }

    pub fn count_with_status(&self, status: JobStatus) -> Result<u64> {
        let conn = self.lock()?;
        let n = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            [status.as_str()],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Return jobs orphaned in `running` by a previous process to `scheduled`
    /// and close their open executions as failed.
    ///
    /// Returns the number of jobs rescheduled.
    pub fn recover_interrupted(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = ts(now);
        let closed = tx.execute(
            "UPDATE job_executions
             SET status = 'failed', end_time = ?1, error_message = 'interrupted by restart'
             WHERE end_time IS NULL",
            [&now],
        )?;
        let rescheduled = tx.execute(
            "UPDATE jobs SET status = 'scheduled', next_run_time = ?1, updated_at = ?1
             WHERE status = 'running'",
            [&now],
        )?;
        tx.commit()?;
        if rescheduled > 0 || closed > 0 {
            warn!(rescheduled, closed, "recovered jobs interrupted by a previous run");
        }
        Ok(rescheduled)
    }

    // --- executions --------------------------------------------------------

    pub fn insert_execution(&self, exec: &JobExecution) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO job_executions ({EXECUTION_COLUMNS})
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8)"
            ),
            params![
                exec.id,
                exec.job_id,
                exec.status.as_str(),
                ts(exec.start_time),
                ts_opt(exec.end_time),
                exec.result.as_ref().map(serde_json::to_string).transpose()?,
                exec.error_message,
                serde_json::to_string(&exec.logs)?,
            ],
        )?;
        Ok(())
    }

    /// Write the closing state of an execution.
    pub fn update_execution(&self, exec: &JobExecution) -> Result<()> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE job_executions
             SET status = ?1, end_time = ?2, result = ?3, error_message = ?4, logs = ?5
             WHERE id = ?6",
            params![
                exec.status.as_str(),
                ts_opt(exec.end_time),
                exec.result.as_ref().map(serde_json::to_string).transpose()?,
                exec.error_message,
                serde_json::to_string(&exec.logs)?,
                exec.id,
            ],
        )?;
        if n == 0 {
            warn!(execution_id = %exec.id, "execution row missing on close");
        }
        Ok(())
    }

    /// Execution history for one job, most recent first.
    pub fn list_executions(&self, job_id: &str, limit: u32) -> Result<Vec<JobExecution>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions
             WHERE job_id = ?1
             ORDER BY start_time DESC, id DESC
             LIMIT ?2"
        ))?;
        let execs = stmt
            .query_map(params![job_id, limit], row_to_execution)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(execs)
    }

    /// Latest executions across all jobs, most recent first.
    pub fn recent_executions(&self, limit: u32) -> Result<Vec<JobExecution>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions
             ORDER BY start_time DESC, id DESC
             LIMIT ?1"
        ))?;
        let execs = stmt
            .query_map([limit], row_to_execution)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(execs)
    }

    /// `(total, completed)` executions started at or after `since`.
    pub fn execution_stats(&self, since: DateTime<Utc>) -> Result<(u64, u64)> {
        let conn = self.lock()?;
        let stats = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0)
             FROM job_executions WHERE start_time >= ?1",
            [ts(since)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(stats)
    }

    /// Delete closed execution records that started before `cutoff`.
    ///
    /// Open executions are never pruned; job definitions are never touched.
    pub fn prune_executions(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM job_executions WHERE start_time < ?1 AND end_time IS NOT NULL",
            [ts(cutoff)],
        )?;
        if n > 0 {
            info!(pruned = n, "old execution records pruned");
        }
        Ok(n)
    }

    // --- resource snapshots ------------------------------------------------

    pub fn insert_snapshot(&self, snap: &ResourceSnapshot) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO resource_usage (timestamp, active_jobs, queue_size, throughput_jobs_per_hour)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                ts(snap.timestamp),
                snap.active_jobs as i64,
                snap.queue_size as i64,
                snap.throughput_jobs_per_hour,
            ],
        )?;
        Ok(())
    }

    pub fn latest_snapshot(&self) -> Result<Option<ResourceSnapshot>> {
        let conn = self.lock()?;
        let snap = conn
            .query_row(
                "SELECT timestamp, active_jobs, queue_size, throughput_jobs_per_hour
                 FROM resource_usage ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(ResourceSnapshot {
                        timestamp: parse_ts(0, &row.get::<_, String>(0)?)?,
                        active_jobs: row.get::<_, i64>(1)?.max(0) as usize,
                        queue_size: row.get::<_, i64>(2)?.max(0) as u64,
                        throughput_jobs_per_hour: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(snap)
    }

    /// Drop snapshots older than `cutoff`; they share the execution retention window.
    pub fn prune_snapshots(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        Ok(conn.execute("DELETE FROM resource_usage WHERE timestamp < ?1", [ts(cutoff)])?)
    }
}

// --- row mapping -----------------------------------------------------------

fn conversion_error(
    idx: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
}

fn parse_col<T: std::str::FromStr<Err = String>>(idx: usize, s: &str) -> rusqlite::Result<T> {
    s.parse().map_err(|e: String| conversion_error(idx, e))
}

fn json_col<T: serde::de::DeserializeOwned>(idx: usize, s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|e| conversion_error(idx, e))
}

fn opt_ts(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(idx, &s)).transpose()
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<ScheduledJob> {
    let job_type: String = row.get(3)?;
    let job_data: serde_json::Value = json_col(7, &row.get::<_, String>(7)?)?;
    let payload = JobPayload::from_parts(&job_type, job_data)
        .map_err(|e| conversion_error(7, e.to_string()))?;
    let rank: i64 = row.get(4)?;

    Ok(ScheduledJob {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        priority: JobPriority::from_rank(rank)
            .ok_or_else(|| conversion_error(4, format!("priority out of range: {rank}")))?,
        schedule_kind: parse_col::<ScheduleKind>(5, &row.get::<_, String>(5)?)?,
        schedule_expression: row.get(6)?,
        payload,
        status: parse_col::<JobStatus>(8, &row.get::<_, String>(8)?)?,
        next_run_time: opt_ts(9, row.get(9)?)?,
        last_run_time: opt_ts(10, row.get(10)?)?,
        run_count: row.get(11)?,
        max_runs: row.get(12)?,
        retry_count: row.get(13)?,
        max_retries: row.get(14)?,
        timeout_minutes: row.get(15)?,
        dependencies: json_col(16, &row.get::<_, String>(16)?)?,
        metadata: json_col(17, &row.get::<_, String>(17)?)?,
        created_by: row.get(18)?,
        created_at: parse_ts(19, &row.get::<_, String>(19)?)?,
        updated_at: parse_ts(20, &row.get::<_, String>(20)?)?,
    })
}

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<JobExecution> {
    let result: Option<String> = row.get(5)?;
    Ok(JobExecution {
        id: row.get(0)?,
        job_id: row.get(1)?,
        status: parse_col::<ExecutionStatus>(2, &row.get::<_, String>(2)?)?,
        start_time: parse_ts(3, &row.get::<_, String>(3)?)?,
        end_time: opt_ts(4, row.get(4)?)?,
        result: result.map(|s| json_col(5, &s)).transpose()?,
        error_message: row.get(6)?,
        logs: json_col(7, &row.get::<_, String>(7)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job(id: &str, priority: JobPriority, next: DateTime<Utc>) -> ScheduledJob {
        ScheduledJob {
            id: id.to_string(),
            name: format!("job {id}"),
            description: String::new(),
            priority,
            schedule_kind: ScheduleKind::OneTime,
            schedule_expression: next.to_rfc3339(),
            payload: JobPayload::from_parts("noop", serde_json::json!({})).unwrap(),
            status: JobStatus::Scheduled,
            next_run_time: Some(next),
            last_run_time: None,
            run_count: 0,
            max_runs: None,
            retry_count: 0,
            max_retries: 3,
            timeout_minutes: 60,
            dependencies: Vec::new(),
            metadata: BTreeMap::new(),
            created_by: "test".into(),
            created_at: next - Duration::hours(1),
            updated_at: next - Duration::hours(1),
        }
    }

    #[test]
    fn ready_jobs_ordered_by_priority_then_due_time() {
        let repo = JobRepository::in_memory().unwrap();
        let now = Utc::now();
        repo.insert(&job("low-old", JobPriority::Low, now - Duration::minutes(10))).unwrap();
        repo.insert(&job("high-new", JobPriority::High, now - Duration::minutes(1))).unwrap();
        repo.insert(&job("high-old", JobPriority::High, now - Duration::minutes(5))).unwrap();
        repo.insert(&job("future", JobPriority::Critical, now + Duration::minutes(5))).unwrap();

        let ready: Vec<String> = repo.list_ready(now, 10).unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ready, vec!["high-old", "high-new", "low-old"]);

        let limited = repo.list_ready(now, 1).unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, "high-old");
        assert!(repo.list_ready(now, 0).unwrap().is_empty());
    }

    #[test]
    fn undecodable_ready_row_is_skipped() {
        let repo = JobRepository::in_memory().unwrap();
        let now = Utc::now();
        repo.insert(&job("bad", JobPriority::Critical, now - Duration::minutes(1))).unwrap();
        repo.insert(&job("good", JobPriority::Low, now - Duration::minutes(1))).unwrap();
        repo.lock()
            .unwrap()
            .execute("UPDATE jobs SET job_data = 'not json' WHERE id = 'bad'", [])
            .unwrap();

        let page = repo.list_ready_page(now, 10, 0).unwrap();
        assert_eq!(page.scanned, 2);
        let ids: Vec<String> = page.jobs.into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec!["good"]);

        let next = repo.list_ready_page(now, 10, 1).unwrap();
        assert_eq!(next.scanned, 1);
        assert_eq!(next.jobs[0].id, "good");
    }

    #[test]
    fn row_round_trip_preserves_fields() {
        let repo = JobRepository::in_memory().unwrap();
        let mut j = job("a", JobPriority::Urgent, crate::clock::truncate_micros(Utc::now()));
        j.dependencies = vec!["x".into()];
        j.metadata.insert("owner".into(), "ops".into());
        j.max_runs = Some(4);
        repo.insert(&j).unwrap();
        let back = repo.get_required("a").unwrap();
        assert_eq!(back.priority, JobPriority::Urgent);
        assert_eq!(back.dependencies, vec!["x".to_string()]);
        assert_eq!(back.metadata["owner"], "ops");
        assert_eq!(back.max_runs, Some(4));
        assert_eq!(back.next_run_time, j.next_run_time);
        assert_eq!(back.created_at, j.created_at);
    }

    #[test]
    fn claim_only_succeeds_once() {
        let repo = JobRepository::in_memory().unwrap();
        repo.insert(&job("a", JobPriority::Normal, Utc::now())).unwrap();
        assert!(repo.claim("a", Utc::now()).unwrap());
        assert!(!repo.claim("a", Utc::now()).unwrap());
        assert_eq!(repo.status_of("a").unwrap(), Some(JobStatus::Running));
    }

    #[test]
    fn cancel_is_idempotent_on_terminal_jobs() {
        let repo = JobRepository::in_memory().unwrap();
        let mut done = job("done", JobPriority::Normal, Utc::now());
        done.status = JobStatus::Completed;
        done.next_run_time = None;
        repo.insert(&done).unwrap();
        repo.insert(&job("live", JobPriority::Normal, Utc::now())).unwrap();

        assert_eq!(
            repo.cancel("done", Utc::now()).unwrap(),
            CancelOutcome::NotCancellable { status: JobStatus::Completed }
        );
        assert_eq!(repo.status_of("done").unwrap(), Some(JobStatus::Completed));

        assert_eq!(
            repo.cancel("live", Utc::now()).unwrap(),
            CancelOutcome::Cancelled { previous: JobStatus::Scheduled }
        );
        let live = repo.get_required("live").unwrap();
        assert_eq!(live.status, JobStatus::Cancelled);
        assert!(live.next_run_time.is_none());

        assert!(matches!(
            repo.cancel("nope", Utc::now()),
            Err(SchedulerError::JobNotFound { .. })
        ));
    }

    #[test]
    fn conditional_update_respects_status() {
        let repo = JobRepository::in_memory().unwrap();
        let mut j = job("a", JobPriority::Normal, Utc::now());
        repo.insert(&j).unwrap();
        repo.cancel("a", Utc::now()).unwrap();
        j.status = JobStatus::Completed;
        assert!(!repo.update_if_status(&j, JobStatus::Running).unwrap());
        assert_eq!(repo.status_of("a").unwrap(), Some(JobStatus::Cancelled));
    }

    #[test]
    fn prune_keeps_open_and_recent_executions() {
        let repo = JobRepository::in_memory().unwrap();
        let now = Utc::now();
        repo.insert(&job("a", JobPriority::Normal, now)).unwrap();
        let mk = |id: &str, start: DateTime<Utc>, closed: bool| JobExecution {
            id: id.into(),
            job_id: "a".into(),
            status: if closed { ExecutionStatus::Completed } else { ExecutionStatus::Running },
            start_time: start,
            end_time: closed.then_some(start + Duration::seconds(1)),
            result: None,
            error_message: None,
            logs: vec![],
        };
        repo.insert_execution(&mk("old", now - Duration::days(40), true)).unwrap();
        repo.insert_execution(&mk("old-open", now - Duration::days(40), false)).unwrap();
        repo.insert_execution(&mk("new", now - Duration::days(1), true)).unwrap();

        assert_eq!(repo.prune_executions(now - Duration::days(30)).unwrap(), 1);
        let ids: Vec<String> = repo.list_executions("a", 10).unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["new", "old-open"]);
        assert!(repo.exists("a").unwrap());
    }

    #[test]
    fn recovery_reschedules_running_jobs() {
        let repo = JobRepository::in_memory().unwrap();
        let now = Utc::now();
        repo.insert(&job("a", JobPriority::Normal, now)).unwrap();
        repo.claim("a", now).unwrap();
        repo.insert_execution(&JobExecution {
            id: "e1".into(),
            job_id: "a".into(),
            status: ExecutionStatus::Running,
            start_time: now,
            end_time: None,
            result: None,
            error_message: None,
            logs: vec![],
        })
        .unwrap();

        assert_eq!(repo.recover_interrupted(now).unwrap(), 1);
        assert_eq!(repo.status_of("a").unwrap(), Some(JobStatus::Scheduled));
        let exec = &repo.list_executions("a", 1).unwrap()[0];
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.error_message.as_deref(), Some("interrupted by restart"));
    }
}
