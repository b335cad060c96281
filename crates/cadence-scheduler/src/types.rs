use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::payload::JobPayload;

/// Ordered priority tier. Higher tiers are admitted first when capacity is scarce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
    Critical,
}

impl JobPriority {
    /// Integer rank persisted in the `priority` column (low = 1 … critical = 5).
    pub fn rank(self) -> i64 {
        match self {
            JobPriority::Low => 1,
            JobPriority::Normal => 2,
            JobPriority::High => 3,
            JobPriority::Urgent => 4,
            JobPriority::Critical => 5,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            1 => Some(JobPriority::Low),
            2 => Some(JobPriority::Normal),
            3 => Some(JobPriority::High),
            4 => Some(JobPriority::Urgent),
            5 => Some(JobPriority::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
            JobPriority::Urgent => "urgent",
            JobPriority::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobPriority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" | "1" => Ok(JobPriority::Low),
            "normal" | "2" => Ok(JobPriority::Normal),
            "high" | "3" => Ok(JobPriority::High),
            "urgent" | "4" => Ok(JobPriority::Urgent),
            "critical" | "5" => Ok(JobPriority::Critical),
            other => Err(format!("unknown job priority: {other}")),
        }
    }
}

/// Whether a job fires once at a literal instant or repeatedly on a cron expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    OneTime,
    Recurring,
}

impl std::fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleKind::OneTime => write!(f, "one_time"),
            ScheduleKind::Recurring => write!(f, "recurring"),
        }
    }
}

impl std::str::FromStr for ScheduleKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "one_time" => Ok(ScheduleKind::OneTime),
            "recurring" => Ok(ScheduleKind::Recurring),
            other => Err(format!("unknown schedule kind: {other}")),
        }
    }
}

/// Lifecycle state of a scheduled job.
///
/// ```text
/// scheduled ──claim──▶ running ──ok──▶ completed | scheduled (recurring)
///     ▲  │                 │ └─err──▶ scheduled (retry) | failed
///     │  ▼                 ▼
///   paused ─────────▶ cancelled ◀── scheduled / running
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its next_run_time.
    Scheduled,
    /// Claimed by the dispatch loop; an execution is open.
    Running,
    /// Finished for good (one-time success or recurring job at max_runs).
    Completed,
    /// Out of retries, or failed in a way retrying cannot fix.
    Failed,
    /// Manually cancelled.
    Cancelled,
    /// Held by an operator; skipped by dispatch until resumed.
    Paused,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Scheduled,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Paused,
    ];

    /// Terminal states never run again and have no next_run_time.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Edges of the job state machine.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Scheduled, Running)
                | (Running, Completed)
                | (Running, Scheduled)
                | (Running, Failed)
                | (Scheduled, Paused)
                | (Paused, Scheduled)
                | (Scheduled, Cancelled)
                | (Running, Cancelled)
                | (Paused, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Paused => "paused",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(JobStatus::Scheduled),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "paused" => Ok(JobStatus::Paused),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Outcome of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::TimedOut => "timed_out",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "timed_out" => Ok(ExecutionStatus::TimedOut),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// A persisted job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// UUID v7 string, primary key.
    pub id: String,
    /// Human-readable label.
    pub name: String,
    pub description: String,
    pub priority: JobPriority,
    pub schedule_kind: ScheduleKind,
    /// RFC 3339 instant for one-time jobs, five-field cron for recurring ones.
    pub schedule_expression: String,
    /// Typed payload; its job type selects the handler.
    pub payload: JobPayload,
    pub status: JobStatus,
    /// None only while the job is terminal.
    pub next_run_time: Option<DateTime<Utc>>,
    /// Start of the most recent execution, if any.
    pub last_run_time: Option<DateTime<Utc>>,
    /// Number of successful runs.
    pub run_count: u32,
    /// Recurring jobs complete after this many successful runs; None means unlimited.
    pub max_runs: Option<u32>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_minutes: u32,
    /// Jobs that must be `completed` before this one may run.
    pub dependencies: Vec<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledJob {
    /// The opaque string used to resolve a handler.
    pub fn job_type(&self) -> &str {
        self.payload.job_type()
    }

    pub fn retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// One attempt to run a job's handler. Immutable once `end_time` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: String,
    pub job_id: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub logs: Vec<String>,
}

impl JobExecution {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// A job creation request. Validated by the management handle before insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: JobPriority,
    pub schedule_kind: ScheduleKind,
    pub schedule_expression: String,
    pub job_type: String,
    #[serde(default)]
    pub job_data: serde_json::Value,
    #[serde(default)]
    pub max_runs: Option<u32>,
    /// Falls back to `scheduler.default_max_retries`.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Falls back to `scheduler.default_timeout_minutes`.
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default = "default_created_by")]
    pub created_by: String,
}

fn default_created_by() -> String {
    "system".to_string()
}

impl NewJob {
    pub fn new(
        name: impl Into<String>,
        job_type: impl Into<String>,
        schedule_kind: ScheduleKind,
        schedule_expression: impl Into<String>,
        job_data: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            priority: JobPriority::Normal,
            schedule_kind,
            schedule_expression: schedule_expression.into(),
            job_type: job_type.into(),
            job_data,
            max_runs: None,
            max_retries: None,
            timeout_minutes: None,
            dependencies: Vec::new(),
            metadata: BTreeMap::new(),
            created_by: default_created_by(),
        }
    }

    /// A one-time job at `at`.
    pub fn once(
        name: impl Into<String>,
        job_type: impl Into<String>,
        at: DateTime<Utc>,
        job_data: serde_json::Value,
    ) -> Self {
        Self::new(name, job_type, ScheduleKind::OneTime, at.to_rfc3339(), job_data)
    }

    /// A recurring job on a cron expression.
    pub fn recurring(
        name: impl Into<String>,
        job_type: impl Into<String>,
        cron: impl Into<String>,
        job_data: serde_json::Value,
    ) -> Self {
        Self::new(name, job_type, ScheduleKind::Recurring, cron, job_data)
    }

    /// Recurring batch text classification over a file.
    #[allow(clippy::too_many_arguments)]
    pub fn recurring_batch(
        name: impl Into<String>,
        file_path: impl Into<String>,
        labels: Vec<String>,
        instructions: impl Into<String>,
        cron: impl Into<String>,
        mother_ai_model: impl Into<String>,
        child_ai_model: impl Into<String>,
    ) -> Self {
        let file_path = file_path.into();
        let data = serde_json::json!({
            "file_path": file_path,
            "labels": labels,
            "instructions": instructions.into(),
            "mother_ai_model": mother_ai_model.into(),
            "child_ai_model": child_ai_model.into(),
        });
        let mut job = Self::recurring(name, crate::payload::BATCH_TEXT_CLASSIFICATION, cron, data);
        job.description = format!("Recurring batch processing of {file_path}");
        job.metadata
            .insert("created_for".into(), "recurring_processing".into());
        job.metadata.insert("auto_generated".into(), true.into());
        job
    }

    /// One-time export of another job's results.
    pub fn export(
        source_job_id: impl Into<String>,
        export_format: impl Into<String>,
        at: DateTime<Utc>,
        recipients: Vec<String>,
    ) -> Self {
        let source_job_id = source_job_id.into();
        let export_format = export_format.into();
        let data = serde_json::json!({
            "source_job_id": source_job_id,
            "export_format": export_format,
            "recipients": recipients,
        });
        let mut job = Self::once(
            format!("Export Job {source_job_id}"),
            crate::payload::EXPORT,
            at,
            data,
        );
        job.description =
            format!("Scheduled export of job {source_job_id} in {export_format} format");
        job
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = Some(max_runs);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout_minutes(mut self, minutes: u32) -> Self {
        self.timeout_minutes = Some(minutes);
        self
    }
}

/// Partial update. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub priority: Option<JobPriority>,
    pub schedule_kind: Option<ScheduleKind>,
    pub schedule_expression: Option<String>,
    /// Replaces the payload data; the job type itself cannot change.
    pub job_data: Option<serde_json::Value>,
    /// `Some(None)` clears the limit.
    pub max_runs: Option<Option<u32>>,
    pub max_retries: Option<u32>,
    pub timeout_minutes: Option<u32>,
    pub dependencies: Option<Vec<String>>,
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

impl JobPatch {
    pub fn touches_schedule(&self) -> bool {
        self.schedule_kind.is_some() || self.schedule_expression.is_some()
    }
}

/// Listing filter with offset pagination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            job_type: None,
            limit: 100,
            offset: 0,
        }
    }
}

/// Result of a cancel request. Cancelling a terminal job is a no-op, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job moved to `cancelled` from `previous`.
    Cancelled { previous: JobStatus },
    /// The job was already terminal; nothing changed.
    NotCancellable { status: JobStatus },
}

/// Operations accepted by [`crate::SchedulerHandle::batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOperation {
    Pause,
    Resume,
    Cancel,
}

impl std::str::FromStr for BatchOperation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pause" => Ok(BatchOperation::Pause),
            "resume" => Ok(BatchOperation::Resume),
            "cancel" => Ok(BatchOperation::Cancel),
            other => Err(format!("unknown batch operation: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub successful: Vec<String>,
    /// Failed ids with the reason each was rejected.
    pub failed: Vec<(String, String)>,
}
