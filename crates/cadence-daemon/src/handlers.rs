//! Built-in job handlers registered by the daemon.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context};
use async_trait::async_trait;
use cadence_scheduler::payload::{
    BatchClassification, CleanupRequest, ExportRequest, BATCH_TEXT_CLASSIFICATION, CLEANUP, EXPORT,
};
use cadence_scheduler::{HandlerRegistry, JobContext, JobHandler, JobPayload, JobRepository};
use serde_json::json;
use tracing::info;

/// Register every built-in handler. Export artefacts land in `artifacts_dir`,
/// which is also what cleanup jobs prune.
pub(crate) fn register_builtin(registry: &mut HandlerRegistry, repo: JobRepository, artifacts_dir: PathBuf) {
    registry.register(BATCH_TEXT_CLASSIFICATION, BatchClassificationHandler);
    registry.register(
        EXPORT,
        ExportHandler {
            repo,
            out_dir: artifacts_dir.clone(),
        },
    );
    registry.register(CLEANUP, CleanupHandler { dir: artifacts_dir });
}

fn wrong_payload(expected: &str, got: &JobPayload) -> anyhow::Error {
    anyhow::anyhow!("{expected} handler received a {} payload", got.job_type())
}

/// Reads the input file and prepares it for the classification service.
///
/// The classification itself runs elsewhere; this job validates the input,
/// counts its records and reports what was handed over.
struct BatchClassificationHandler;

#[async_trait]
impl JobHandler for BatchClassificationHandler {
    async fn run(&self, ctx: &JobContext, payload: &JobPayload) -> anyhow::Result<serde_json::Value> {
        let JobPayload::BatchTextClassification(req) = payload else {
            return Err(wrong_payload(BATCH_TEXT_CLASSIFICATION, payload));
        };
        let BatchClassification {
            file_path,
            labels,
            mother_ai_model,
            child_ai_model,
            ..
        } = req;

        let text = tokio::fs::read_to_string(file_path)
            .await
            .with_context(|| format!("batch classification failed: cannot read {file_path}"))?;
        if ctx.is_cancelled() {
            bail!("cancelled before dispatch");
        }
        let records = text.lines().filter(|l| !l.trim().is_empty()).count();
        ctx.log(format!("{records} records read from {file_path}"));

        let file_name = Path::new(file_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_path.clone());
        info!(job_id = %ctx.job_id, records, %file_name, "batch dispatched");
        Ok(json!({
            "status": "dispatched",
            "file": file_name,
            "records": records,
            "labels": labels.len(),
            "mother_ai_model": mother_ai_model,
            "child_ai_model": child_ai_model,
        }))
    }
}

/// Writes the execution history of another job to a file.
struct ExportHandler {
    repo: JobRepository,
    out_dir: PathBuf,
}

#[async_trait]
impl JobHandler for ExportHandler {
    async fn run(&self, ctx: &JobContext, payload: &JobPayload) -> anyhow::Result<serde_json::Value> {
        let JobPayload::Export(req) = payload else {
            return Err(wrong_payload(EXPORT, payload));
        };
        let ExportRequest {
            source_job_id,
            export_format,
            recipients,
        } = req;

        let job = self
            .repo
            .get(source_job_id)?
            .with_context(|| format!("export failed: job {source_job_id} does not exist"))?;
        let executions = self.repo.list_executions(source_job_id, u32::MAX)?;

        let body = match export_format.as_str() {
            "json" => serde_json::to_string_pretty(&json!({ "job": job, "executions": executions }))?,
            "csv" => {
                let mut out = String::from("execution_id,status,start_time,end_time,error_message\n");
                for e in &executions {
                    out.push_str(&format!(
                        "{},{},{},{},{}\n",
                        e.id,
                        e.status,
                        e.start_time.to_rfc3339(),
                        e.end_time.map(|t| t.to_rfc3339()).unwrap_or_default(),
                        csv_field(e.error_message.as_deref().unwrap_or("")),
                    ));
                }
                out
            }
            other => bail!("export failed: unsupported format {other:?}"),
        };

        tokio::fs::create_dir_all(&self.out_dir).await?;
        let path = self
            .out_dir
            .join(format!("export-{source_job_id}-{}.{export_format}", ctx.execution_id));
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("export failed: cannot write {}", path.display()))?;
        ctx.log(format!("wrote {} executions to {}", executions.len(), path.display()));
        if !recipients.is_empty() {
            // Delivery is owned by the notification service, which picks files up from here.
            ctx.log(format!("queued for {} recipients", recipients.len()));
        }

        Ok(json!({
            "exported_job_id": source_job_id,
            "format": export_format,
            "status": "exported",
            "path": path.display().to_string(),
            "executions": executions.len(),
        }))
    }
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// Deletes files older than `days_old` from the artefacts directory.
struct CleanupHandler {
    dir: PathBuf,
}

#[async_trait]
impl JobHandler for CleanupHandler {
    async fn run(&self, ctx: &JobContext, payload: &JobPayload) -> anyhow::Result<serde_json::Value> {
        let JobPayload::Cleanup(CleanupRequest { days_old }) = payload else {
            return Err(wrong_payload(CLEANUP, payload));
        };
        let max_age = Duration::from_secs(u64::from(*days_old) * 24 * 3600);
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(json!({ "files_cleaned": 0 }));
            }
            Err(e) => return Err(e).context("cleanup failed"),
        };

        let mut cleaned = 0u64;
        while let Some(entry) = entries.next_entry().await? {
            if ctx.is_cancelled() {
                break;
            }
            let meta = entry.metadata().await?;
            if meta.is_file() && meta.modified()? < cutoff {
                tokio::fs::remove_file(entry.path()).await?;
                cleaned += 1;
            }
        }
        ctx.log(format!("removed {cleaned} files older than {days_old} days"));
        Ok(json!({ "files_cleaned": cleaned }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::SchedulerConfig;
    use cadence_scheduler::{NewJob, SchedulerEngine};
    use tokio_util::sync::CancellationToken;

    fn ctx() -> JobContext {
        JobContext::new("job-1", "exec-1", 1, CancellationToken::new())
    }

    #[tokio::test]
    async fn batch_counts_non_empty_records() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("reviews.txt");
        std::fs::write(&file, "great\n\nterrible\nfine\n").unwrap();
        let payload = JobPayload::from_parts(
            BATCH_TEXT_CLASSIFICATION,
            json!({
                "file_path": file.to_str().unwrap(),
                "labels": ["positive", "negative"],
                "mother_ai_model": "m",
                "child_ai_model": "c",
            }),
        )
        .unwrap();

        let c = ctx();
        let out = BatchClassificationHandler.run(&c, &payload).await.unwrap();
        assert_eq!(out["records"], 3);
        assert_eq!(out["file"], "reviews.txt");
        assert_eq!(c.execution_id, "exec-1");
    }

    #[tokio::test]
    async fn batch_missing_file_is_an_error() {
        let payload = JobPayload::from_parts(
            BATCH_TEXT_CLASSIFICATION,
            json!({
                "file_path": "/nonexistent/input.csv",
                "labels": ["a"],
                "mother_ai_model": "m",
                "child_ai_model": "c",
            }),
        )
        .unwrap();
        let err = BatchClassificationHandler.run(&ctx(), &payload).await.unwrap_err();
        assert!(format!("{err:#}").contains("cannot read"));
    }

    #[tokio::test]
    async fn export_writes_csv_history() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JobRepository::in_memory().unwrap();
        let engine = SchedulerEngine::new(repo.clone(), HandlerRegistry::new(), SchedulerConfig::default());
        let source = engine
            .handle()
            .create_job(NewJob::recurring("source", "noop", "0 * * * *", json!({})))
            .unwrap();

        let handler = ExportHandler {
            repo,
            out_dir: dir.path().to_path_buf(),
        };
        let payload = JobPayload::from_parts(
            EXPORT,
            json!({ "source_job_id": source.id, "export_format": "csv" }),
        )
        .unwrap();
        let out = handler.run(&ctx(), &payload).await.unwrap();
        let written = std::fs::read_to_string(out["path"].as_str().unwrap()).unwrap();
        assert!(written.starts_with("execution_id,status"));

        let bad = JobPayload::from_parts(
            EXPORT,
            json!({ "source_job_id": source.id, "export_format": "xlsx" }),
        )
        .unwrap();
        assert!(handler.run(&ctx(), &bad).await.is_err());
    }

    #[tokio::test]
    async fn cleanup_removes_old_files_only_from_its_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.json"), "{}").unwrap();
        let handler = CleanupHandler {
            dir: dir.path().to_path_buf(),
        };

        let keep = JobPayload::from_parts(CLEANUP, json!({ "days_old": 30 })).unwrap();
        assert_eq!(handler.run(&ctx(), &keep).await.unwrap()["files_cleaned"], 0);

        let all = JobPayload::from_parts(CLEANUP, json!({ "days_old": 0 })).unwrap();
        assert_eq!(handler.run(&ctx(), &all).await.unwrap()["files_cleaned"], 1);

        let missing = CleanupHandler {
            dir: dir.path().join("never-created"),
        };
        assert_eq!(missing.run(&ctx(), &keep).await.unwrap()["files_cleaned"], 0);
    }

    #[tokio::test]
    async fn mismatched_payload_is_rejected() {
        let payload = JobPayload::from_parts(CLEANUP, json!({})).unwrap();
        let err = BatchClassificationHandler.run(&ctx(), &payload).await.unwrap_err();
        assert!(err.to_string().contains("cleanup payload"));
    }

    #[test]
    fn csv_fields_are_quoted_when_needed() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
