//! Read-only aggregates for dashboards.
//!
//! Nothing here feeds back into scheduling decisions.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    repository::JobRepository,
    types::{JobExecution, JobPriority, JobStatus, ScheduledJob},
};

const UPCOMING_WINDOW_HOURS: i64 = 24;
const UPCOMING_LIMIT: u32 = 10;
const RECENT_EXECUTIONS_LIMIT: u32 = 10;

/// A periodic, derived record of engine load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub active_jobs: usize,
    /// Jobs waiting in `scheduled`.
    pub queue_size: u64,
    /// Executions completed during the hour before `timestamp`.
    pub throughput_jobs_per_hour: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpcomingJob {
    pub id: String,
    pub name: String,
    pub job_type: String,
    pub priority: JobPriority,
    pub next_run_time: Option<DateTime<Utc>>,
}

impl From<ScheduledJob> for UpcomingJob {
    fn from(job: ScheduledJob) -> Self {
        Self {
            job_type: job.job_type().to_string(),
            id: job.id,
            name: job.name,
            priority: job.priority,
            next_run_time: job.next_run_time,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentResources {
    pub active_jobs: usize,
    pub max_concurrent: usize,
    pub queue_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Performance {
    /// Percentage of executions started in the last 24h that completed, 2 decimals.
    pub success_rate_24h: f64,
    pub total_executions_24h: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dashboard {
    pub scheduler_status: EngineState,
    /// Every status is present, zero when no job has it.
    pub job_counts: BTreeMap<String, u64>,
    pub upcoming_jobs: Vec<UpcomingJob>,
    pub recent_executions: Vec<JobExecution>,
    pub current_resources: CurrentResources,
    pub latest_snapshot: Option<ResourceSnapshot>,
    pub performance: Performance,
    pub generated_at: DateTime<Utc>,
}

/// Measure current load. `active_jobs` comes from the engine, the rest from the store.
pub fn take_snapshot(
    repo: &JobRepository,
    active_jobs: usize,
    now: DateTime<Utc>,
) -> Result<ResourceSnapshot> {
    let queue_size = repo.count_with_status(JobStatus::Scheduled)?;
    let (_, completed) = repo.execution_stats(now - Duration::hours(1))?;
    Ok(ResourceSnapshot {
        timestamp: now,
        active_jobs,
        queue_size,
        throughput_jobs_per_hour: completed as f64,
    })
}

pub fn build_dashboard(
    repo: &JobRepository,
    state: EngineState,
    active_jobs: usize,
    max_concurrent: usize,
    now: DateTime<Utc>,
) -> Result<Dashboard> {
    let mut job_counts: BTreeMap<String, u64> = JobStatus::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();
    job_counts.extend(repo.counts_by_status()?);

    let upcoming_jobs = repo
        .upcoming(now + Duration::hours(UPCOMING_WINDOW_HOURS), UPCOMING_LIMIT)?
        .into_iter()
        .map(UpcomingJob::from)
        .collect();

    let (total, completed) = repo.execution_stats(now - Duration::hours(24))?;

    Ok(Dashboard {
        scheduler_status: state,
        current_resources: CurrentResources {
            active_jobs,
            max_concurrent,
            queue_size: job_counts
                .get(JobStatus::Scheduled.as_str())
                .copied()
                .unwrap_or(0),
        },
        job_counts,
        upcoming_jobs,
        recent_executions: repo.recent_executions(RECENT_EXECUTIONS_LIMIT)?,
        latest_snapshot: repo.latest_snapshot()?,
        performance: Performance {
            success_rate_24h: success_rate(total, completed),
            total_executions_24h: total,
        },
        generated_at: now,
    })
}

fn success_rate(total: u64, completed: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (completed as f64 / total as f64 * 10_000.0).round() / 100.0
}
