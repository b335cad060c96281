use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use serde::Serialize;
use tracing::info;

use cadence_core::CadenceConfig;
use cadence_scheduler::{
    HandlerRegistry, JobFilter, JobPatch, JobRepository, NewJob, ScheduleKind, SchedulerEngine,
    SchedulerHandle,
};

mod cli;
mod handlers;

use cli::{Cli, Command, CreateArgs, UpdateArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // load config: --config > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let config_path = cli.config.as_ref().map(|p| p.to_string_lossy().into_owned());
    let (mut config, load_err) = match CadenceConfig::load(config_path.as_deref()) {
        Ok(c) => (c, None),
        Err(e) => (CadenceConfig::default(), Some(e)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter.clone().into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Some(e) = load_err {
        tracing::warn!("Config load failed ({}), using defaults", e);
    }
    if let Some(db) = &cli.db {
        config.database.path = db.to_string_lossy().into_owned();
    }

    if let Command::CronPreset { description } = &cli.command {
        return cron_preset(description.as_deref());
    }

    let db_path = config.database.path.clone();
    ensure_parent_dir(&db_path);
    info!(path = %db_path, "opening SQLite database");

    let db = rusqlite::Connection::open(&db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    let repo = JobRepository::new(db)?;

    let mut registry = HandlerRegistry::new();
    handlers::register_builtin(&mut registry, repo.clone(), artifacts_dir(&db_path));

    let engine = SchedulerEngine::new(repo, registry, config.scheduler.clone());
    let handle = engine.handle();

    match cli.command {
        Command::Run => run(engine).await,
        Command::Create(args) => print(&handle.create_job(new_job(args)?)?),
        Command::Update(args) => {
            let id = args.id.clone();
            print(&handle.update_job(&id, patch(args)?)?)
        }
        Command::List {
            status,
            job_type,
            limit,
            offset,
        } => print(&handle.list_jobs(&JobFilter {
            status,
            job_type,
            limit,
            offset,
        })?),
        Command::Get { id } => print(&handle.get_job(&id)?),
        Command::Cancel { id } => print(&handle.cancel_job(&id)?),
        Command::Pause { id } => print(&handle.pause_job(&id)?),
        Command::Resume { id } => print(&handle.resume_job(&id)?),
        Command::Trigger { id } => print(&handle.trigger_job(&id)?),
        Command::History { id, limit } => print(&handle.job_executions(&id, limit)?),
        Command::Dashboard => print(&handle.dashboard()?),
        Command::Batch { op, ids } => print(&handle.batch(op.into(), &ids)),
        Command::CronPreset { .. } => Ok(()),
    }
}

/// Run the dispatch loop until Ctrl+C, then drain in-flight jobs.
async fn run(engine: SchedulerEngine) -> anyhow::Result<()> {
    let handle: SchedulerHandle = engine.handle();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(async move { engine.run(shutdown_rx).await });
    info!("cadence scheduler running, Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!(running = handle.running_jobs().len(), "shutdown requested");
    let _ = shutdown_tx.send(true);
    task.await?;
    Ok(())
}

fn cron_preset(description: Option<&str>) -> anyhow::Result<()> {
    match description {
        Some(desc) => {
            let (expr, known) = cadence_scheduler::cron::preset_for(desc);
            print(&serde_json::json!({
                "description": desc,
                "cron_expression": expr,
                "known": known,
            }))
        }
        None => {
            let presets: serde_json::Map<String, serde_json::Value> = cadence_scheduler::cron::PRESETS
                .iter()
                .map(|(desc, expr)| (desc.to_string(), serde_json::Value::from(*expr)))
                .collect();
            print(&presets)
        }
    }
}

fn new_job(args: CreateArgs) -> anyhow::Result<NewJob> {
    if let Some(file) = &args.file {
        let body = std::fs::read_to_string(file)
            .with_context(|| format!("cannot read {}", file.display()))?;
        return serde_json::from_str(&body)
            .with_context(|| format!("{} is not a valid job request", file.display()));
    }

    let data: serde_json::Value =
        serde_json::from_str(&args.data).context("--data is not valid JSON")?;
    // clap enforces this unless --file is given
    let Some(name) = args.name else {
        bail!("--name is required");
    };

    let mut job = if let Some(file_path) = args.recurring_batch {
        let Some(cron) = args.cron else {
            bail!("--recurring-batch needs --cron");
        };
        let (Some(mother), Some(child)) = (args.mother_model, args.child_model) else {
            bail!("--recurring-batch needs --mother-model and --child-model");
        };
        let instructions = args.instructions.unwrap_or_default();
        NewJob::recurring_batch(name, file_path, args.labels, instructions, cron, mother, child)
    } else {
        let (kind, expr) = match (args.cron, args.at) {
            (Some(cron), None) => (ScheduleKind::Recurring, cron),
            (None, Some(at)) => (ScheduleKind::OneTime, at),
            _ => bail!("either --cron or --at is required"),
        };
        let Some(job_type) = args.job_type else {
            bail!("--job-type is required");
        };
        NewJob::new(name, job_type, kind, expr, data)
    };

    job = job
        .with_priority(args.priority)
        .with_dependencies(args.depends_on);
    if !args.description.is_empty() {
        job.description = args.description;
    }
    job.max_runs = args.max_runs;
    job.max_retries = args.max_retries;
    job.timeout_minutes = args.timeout_minutes;
    job.created_by = args.created_by;
    Ok(job)
}

fn patch(args: UpdateArgs) -> anyhow::Result<JobPatch> {
    let (schedule_kind, schedule_expression) = match (args.cron, args.at) {
        (Some(cron), _) => (Some(ScheduleKind::Recurring), Some(cron)),
        (None, Some(at)) => (Some(ScheduleKind::OneTime), Some(at)),
        (None, None) => (None, None),
    };
    let job_data = args
        .data
        .map(|d| serde_json::from_str::<serde_json::Value>(&d))
        .transpose()
        .context("--data is not valid JSON")?;
    let max_runs = if args.unlimited_runs {
        Some(None)
    } else {
        args.max_runs.map(Some)
    };

    Ok(JobPatch {
        name: args.name,
        description: args.description,
        priority: args.priority,
        schedule_kind,
        schedule_expression,
        job_data,
        max_runs,
        max_retries: args.max_retries,
        timeout_minutes: args.timeout_minutes,
        dependencies: args.depends_on,
        metadata: None,
    })
}

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Export and cleanup jobs work in `exports/` next to the database file.
fn artifacts_dir(db_path: &str) -> PathBuf {
    Path::new(db_path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join("exports")
}

/// Create the parent directory of `path` if it does not exist yet.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
}
