use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::payload::JobPayload;

/// A unit of work a job delegates to, selected by job type.
///
/// Handlers may be retried after a failure or a restart, so they must tolerate
/// running more than once for the same job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one attempt. The returned value is stored as the execution's result;
    /// an error (with its full chain) becomes the execution's error message.
    async fn run(&self, ctx: &JobContext, payload: &JobPayload) -> anyhow::Result<serde_json::Value>;
}

/// Per-attempt context handed to a handler.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    pub execution_id: String,
    /// 1 for the first attempt, incremented by every retry.
    pub attempt: u32,
    cancel: CancellationToken,
    logs: Arc<Mutex<Vec<String>>>,
}

impl JobContext {
    pub fn new(
        job_id: impl Into<String>,
        execution_id: impl Into<String>,
        attempt: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            execution_id: execution_id.into(),
            attempt,
            cancel,
            logs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// True once the job was cancelled or its timeout expired.
    ///
    /// Cancellation is cooperative: long-running handlers should check this
    /// (or await [`cancelled`](Self::cancelled)) between steps.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Append a line to the execution's log buffer.
    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        debug!(job_id = %self.job_id, execution_id = %self.execution_id, "{line}");
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line);
    }

    pub(crate) fn take_logs(&self) -> Vec<String> {
        std::mem::take(&mut *self.logs.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Adapter so plain async closures can be registered as handlers.
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext, JobPayload) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send,
{
    async fn run(&self, ctx: &JobContext, payload: &JobPayload) -> anyhow::Result<serde_json::Value> {
        (self.0)(ctx.clone(), payload.clone()).await
    }
}

/// Job type → handler map, filled once at startup and read-only afterwards.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`, replacing any earlier registration.
    pub fn register(&mut self, job_type: impl Into<String>, handler: impl JobHandler + 'static) {
        let job_type = job_type.into();
        if self
            .handlers
            .insert(job_type.clone(), Arc::new(handler))
            .is_some()
        {
            warn!(%job_type, "handler replaced");
        } else {
            debug!(%job_type, "handler registered");
        }
    }

    /// Register an async closure for `job_type`.
    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, f: F)
    where
        F: Fn(JobContext, JobPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        self.register(job_type, FnHandler(f));
    }

    pub fn resolve(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        async fn run(&self, ctx: &JobContext, payload: &JobPayload) -> anyhow::Result<serde_json::Value> {
            ctx.log("echoing");
            Ok(payload.data())
        }
    }

    fn ctx() -> JobContext {
        JobContext::new("job", "exec", 1, CancellationToken::new())
    }

    #[tokio::test]
    async fn registered_handler_runs_and_logs() {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", Echo);
        let handler = registry.resolve("echo").unwrap();
        let payload = JobPayload::from_parts("echo", json!({ "n": 1 })).unwrap();
        let c = ctx();
        assert_eq!(handler.run(&c, &payload).await.unwrap(), json!({ "n": 1 }));
        assert_eq!(c.take_logs(), vec!["echoing".to_string()]);
        assert!(c.take_logs().is_empty());
    }

    #[tokio::test]
    async fn closures_can_be_registered() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("attempt", |ctx: JobContext, _p: JobPayload| async move {
            Ok(json!({ "attempt": ctx.attempt }))
        });
        let payload = JobPayload::from_parts("attempt", json!(null)).unwrap();
        let out = registry.resolve("attempt").unwrap().run(&ctx(), &payload).await.unwrap();
        assert_eq!(out, json!({ "attempt": 1 }));
    }

    #[test]
    fn unknown_type_does_not_resolve() {
        let mut registry = HandlerRegistry::new();
        registry.register("b", Echo);
        registry.register("a", Echo);
        assert!(registry.resolve("missing").is_none());
        assert_eq!(registry.job_types(), vec!["a", "b"]);
    }

    #[test]
    fn cancellation_is_visible_through_context() {
        let token = CancellationToken::new();
        let c = JobContext::new("job", "exec", 1, token.clone());
        assert!(!c.is_cancelled());
        token.cancel();
        assert!(c.is_cancelled());
    }
}
