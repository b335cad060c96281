//! `cadence-scheduler`: background job scheduling engine with SQLite persistence.
//!
//! # Overview
//!
//! Jobs are persisted to a SQLite `jobs` table by the [`JobRepository`]. The
//! [`SchedulerEngine`] polls it on a fixed interval, admits ready jobs up to
//! `max_concurrent_jobs` (highest priority first, dependencies permitting) and
//! runs each one on its own task through the [`JobRunner`], which enforces the
//! job's timeout and applies the retry policy. A [`SchedulerHandle`] exposes
//! the management operations while the loop runs.
//!
//! # Job lifecycle
//!
//! | From        | To          | Trigger                                          |
//! |-------------|-------------|--------------------------------------------------|
//! | `scheduled` | `running`   | Dispatch loop claims a due job                   |
//! | `running`   | `completed` | Success (one-time, or recurring at `max_runs`)   |
//! | `running`   | `scheduled` | Recurring success, or failure with retries left  |
//! | `running`   | `failed`    | Out of retries, or no handler for the job type   |
//! | `scheduled` | `paused`    | [`SchedulerHandle::pause_job`]                   |
//! | `paused`    | `scheduled` | [`SchedulerHandle::resume_job`] / `trigger_job`  |
//! | non-terminal| `cancelled` | [`SchedulerHandle::cancel_job`]                  |
//!
//! # Schedule evaluators
//!
//! | Evaluator                 | Behaviour                                         |
//! |---------------------------|---------------------------------------------------|
//! | [`CronEvaluator`]         | Five-field cron, next match strictly after now    |
//! | [`FixedIntervalEvaluator`]| Degraded mode: fixed interval, expression ignored |

pub mod clock;
pub mod cron;
pub mod db;
pub mod engine;
pub mod error;
pub mod handle;
pub mod handler;
pub mod payload;
pub mod repository;
pub mod runner;
pub mod schedule;
pub mod telemetry;
pub mod types;

#[cfg(test)]
mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cron::{CronExpr, CronParseError};
pub use engine::SchedulerEngine;
pub use error::{Result, SchedulerError};
pub use handle::SchedulerHandle;
pub use handler::{HandlerRegistry, JobContext, JobHandler};
pub use payload::JobPayload;
pub use repository::{JobRepository, ReadyPage};
pub use runner::{JobRunner, RetryPolicy};
pub use schedule::{CronEvaluator, FixedIntervalEvaluator, ScheduleEvaluator};
pub use telemetry::{Dashboard, EngineState, ResourceSnapshot};
pub use types::{
    BatchOperation, BatchReport, CancelOutcome, ExecutionStatus, JobExecution, JobFilter,
    JobPatch, JobPriority, JobStatus, NewJob, ScheduleKind, ScheduledJob,
};
