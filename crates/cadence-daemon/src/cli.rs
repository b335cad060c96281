use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use cadence_scheduler::{BatchOperation, JobPriority, JobStatus};

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Background job scheduler: run the dispatch loop or manage jobs in its store.")]
pub(crate) struct Cli {
    /// Config file (default: $CADENCE_CONFIG, then ~/.cadence/cadence.toml).
    #[arg(long, global = true)]
    pub(crate) config: Option<PathBuf>,

    /// Override `database.path` from the config.
    #[arg(long, global = true)]
    pub(crate) db: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the dispatch loop until Ctrl+C.
    Run,
    /// Create a job and print it.
    Create(CreateArgs),
    /// Patch a job. Changing --cron or --at recomputes its next run.
    Update(UpdateArgs),
    /// List jobs in dispatch order.
    List {
        #[arg(long, value_parser = parse_status)]
        status: Option<JobStatus>,
        #[arg(long)]
        job_type: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// Show one job.
    Get { id: String },
    /// Cancel a job (no-op for jobs that already finished).
    Cancel { id: String },
    /// Hold a scheduled job.
    Pause { id: String },
    /// Release a paused job.
    Resume { id: String },
    /// Make a job due now.
    Trigger { id: String },
    /// Execution history of a job, most recent first.
    History {
        id: String,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Status counts, upcoming jobs, recent executions and success rate.
    Dashboard,
    /// Apply pause, resume or cancel to several jobs.
    Batch {
        #[arg(value_enum)]
        op: BatchOp,
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Cron expression for a plain description such as "weekdays at 9am".
    CronPreset {
        /// Leave empty to list every known preset.
        description: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub(crate) enum BatchOp {
    Pause,
    Resume,
    Cancel,
}

impl From<BatchOp> for BatchOperation {
    fn from(op: BatchOp) -> Self {
        match op {
            BatchOp::Pause => BatchOperation::Pause,
            BatchOp::Resume => BatchOperation::Resume,
            BatchOp::Cancel => BatchOperation::Cancel,
        }
    }
}

#[derive(Args)]
pub(crate) struct CreateArgs {
    /// Read the whole request as JSON from this file; other flags are ignored.
    #[arg(long, conflicts_with_all = ["name", "job_type", "cron", "at", "recurring_batch"])]
    pub(crate) file: Option<PathBuf>,

    #[arg(long, required_unless_present = "file")]
    pub(crate) name: Option<String>,

    #[arg(long, required_unless_present_any = ["file", "recurring_batch"])]
    pub(crate) job_type: Option<String>,

    /// Recurring schedule (five-field cron).
    #[arg(long, conflicts_with = "at")]
    pub(crate) cron: Option<String>,

    /// One-time schedule (RFC 3339 timestamp, must be in the future).
    #[arg(long)]
    pub(crate) at: Option<String>,

    /// Payload as inline JSON.
    #[arg(long, default_value = "{}")]
    pub(crate) data: String,

    /// Classify this file on the --cron schedule instead of taking --job-type and --data.
    #[arg(long, requires = "cron", conflicts_with_all = ["job_type", "at"])]
    pub(crate) recurring_batch: Option<String>,

    /// Classification labels, comma separated.
    #[arg(long, value_delimiter = ',', requires = "recurring_batch")]
    pub(crate) labels: Vec<String>,

    #[arg(long, requires = "recurring_batch")]
    pub(crate) instructions: Option<String>,

    #[arg(long, requires = "recurring_batch")]
    pub(crate) mother_model: Option<String>,

    #[arg(long, requires = "recurring_batch")]
    pub(crate) child_model: Option<String>,

    #[arg(long, default_value = "")]
    pub(crate) description: String,

    #[arg(long, value_parser = parse_priority, default_value = "normal")]
    pub(crate) priority: JobPriority,

    #[arg(long)]
    pub(crate) max_runs: Option<u32>,

    #[arg(long)]
    pub(crate) max_retries: Option<u32>,

    #[arg(long)]
    pub(crate) timeout_minutes: Option<u32>,

    /// Job that must complete first. Repeatable.
    #[arg(long = "depends-on")]
    pub(crate) depends_on: Vec<String>,

    #[arg(long, default_value = "cli")]
    pub(crate) created_by: String,
}

#[derive(Args)]
pub(crate) struct UpdateArgs {
    pub(crate) id: String,

    #[arg(long)]
    pub(crate) name: Option<String>,

    #[arg(long)]
    pub(crate) description: Option<String>,

    #[arg(long, value_parser = parse_priority)]
    pub(crate) priority: Option<JobPriority>,

    #[arg(long, conflicts_with = "at")]
    pub(crate) cron: Option<String>,

    #[arg(long)]
    pub(crate) at: Option<String>,

    /// Replacement payload as inline JSON.
    #[arg(long)]
    pub(crate) data: Option<String>,

    #[arg(long, conflicts_with = "unlimited_runs")]
    pub(crate) max_runs: Option<u32>,

    /// Clear `max_runs`.
    #[arg(long)]
    pub(crate) unlimited_runs: bool,

    #[arg(long)]
    pub(crate) max_retries: Option<u32>,

    #[arg(long)]
    pub(crate) timeout_minutes: Option<u32>,

    /// Replace the dependency list. Repeatable.
    #[arg(long = "depends-on")]
    pub(crate) depends_on: Option<Vec<String>>,
}

fn parse_priority(s: &str) -> Result<JobPriority, String> {
    s.parse()
}

fn parse_status(s: &str) -> Result<JobStatus, String> {
    s.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_needs_name_unless_file() {
        assert!(Cli::try_parse_from(["cadence", "create", "--job-type", "x", "--cron", "* * * * *"]).is_err());
        assert!(Cli::try_parse_from(["cadence", "create", "--file", "job.json"]).is_ok());
    }

    #[test]
    fn cron_and_at_are_exclusive() {
        let res = Cli::try_parse_from([
            "cadence", "create", "--name", "n", "--job-type", "x", "--cron", "* * * * *", "--at",
            "2030-01-01T00:00:00Z",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn priority_accepts_names_and_ranks() {
        let cli = Cli::try_parse_from([
            "cadence", "create", "--name", "n", "--job-type", "x", "--cron", "* * * * *",
            "--priority", "4", "--depends-on", "a", "--depends-on", "b",
        ])
        .unwrap();
        let Command::Create(args) = cli.command else {
            panic!("expected create");
        };
        assert_eq!(args.priority, JobPriority::Urgent);
        assert_eq!(args.depends_on, vec!["a", "b"]);
    }

    #[test]
    fn batch_parses_operation() {
        let cli = Cli::try_parse_from(["cadence", "batch", "cancel", "a", "b"]).unwrap();
        let Command::Batch { op, ids } = cli.command else {
            panic!("expected batch");
        };
        assert_eq!(BatchOperation::from(op), BatchOperation::Cancel);
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn recurring_batch_needs_cron_and_skips_job_type() {
        assert!(Cli::try_parse_from([
            "cadence", "create", "--name", "n", "--recurring-batch", "in.csv", "--labels", "a,b",
        ])
        .is_err());

        let cli = Cli::try_parse_from([
            "cadence", "create", "--name", "n", "--recurring-batch", "in.csv", "--cron", "0 9 * * *",
            "--labels", "a,b",
        ])
        .unwrap();
        let Command::Create(args) = cli.command else {
            panic!("expected create");
        };
        assert_eq!(args.recurring_batch.as_deref(), Some("in.csv"));
        assert_eq!(args.labels, vec!["a", "b"]);
        assert!(args.job_type.is_none());
    }
}
