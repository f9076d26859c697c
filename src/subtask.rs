//! Subtask execution.
//!
//! A pipeline for one scope is an ordered list of [`SubTask`]s (collect,
//! extract, convert). [`run_scope`] executes them in order; when one fails,
//! the rest of that scope is skipped. [`run_scopes`] runs independent scopes
//! concurrently, so a failure in one scope never stops another. Every
//! subtask, executed or skipped, leaves a [`SubtaskStatus`] in the store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use lake_harness_core::fingerprint::Fingerprint;
use lake_harness_core::models::{Stage, SubtaskOutcome, SubtaskStatus};
use lake_harness_core::store::Store;

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};

/// Everything a subtask may use. Passed explicitly to every stage.
#[derive(Clone)]
pub struct TaskContext {
    pub run_id: String,
    pub plugin: String,
    pub store: Arc<dyn Store>,
    pub config: Arc<Config>,
    pub cancel: CancelToken,
    pub progress: Arc<dyn ProgressReporter>,
}

impl TaskContext {
    /// A context with a fresh run id, no cancellation and no progress output.
    pub fn new(plugin: impl Into<String>, store: Arc<dyn Store>, config: Arc<Config>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            plugin: plugin.into(),
            store,
            config,
            cancel: CancelToken::new(),
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }
}

/// The resources one pipeline run targets.
#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    pub params: Value,
    pub fingerprint: Fingerprint,
}

impl Scope {
    pub fn new(params: Value) -> Result<Self> {
        let fingerprint = Fingerprint::from_params(&params)
            .map_err(|e| PipelineError::invalid(e.to_string()))?;
        Ok(Self {
            params,
            fingerprint,
        })
    }
}

#[async_trait]
pub trait SubTask: Send + Sync {
    fn name(&self) -> &str;

    fn stage(&self) -> Stage;

    async fn execute(&self, ctx: &TaskContext, scope: &Scope) -> Result<()>;
}

/// Outcome of every subtask of one scope, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeReport {
    pub fingerprint: String,
    pub outcomes: Vec<(String, SubtaskOutcome)>,
}

impl ScopeReport {
    pub fn succeeded(&self) -> bool {
        self.outcomes
            .iter()
            .all(|(_, outcome)| *outcome == SubtaskOutcome::Succeeded)
    }
}

async fn record(
    ctx: &TaskContext,
    scope: &Scope,
    subtask: &dyn SubTask,
    outcome: SubtaskOutcome,
    message: Option<String>,
    began_at: chrono::DateTime<Utc>,
) -> Result<()> {
    let status = SubtaskStatus {
        run_id: ctx.run_id.clone(),
        plugin: ctx.plugin.clone(),
        subtask: subtask.name().to_string(),
        stage: subtask.stage(),
        params: scope.fingerprint.to_string(),
        outcome,
        message,
        began_at,
        finished_at: Utc::now(),
    };
    ctx.store.record_subtask_status(&status).await?;
    ctx.progress.report(ProgressEvent::Finished {
        subtask: status.subtask,
        outcome,
    });
    Ok(())
}

/// Run the subtasks of one scope in order.
///
/// The first failure is returned wrapped in [`PipelineError::Subtask`], after
/// the remaining subtasks were recorded as skipped.
pub async fn run_scope(
    ctx: &TaskContext,
    scope: &Scope,
    subtasks: &[Arc<dyn SubTask>],
) -> Result<ScopeReport> {
    let mut report = ScopeReport {
        fingerprint: scope.fingerprint.to_string(),
        outcomes: Vec::with_capacity(subtasks.len()),
    };
    let mut failure: Option<PipelineError> = None;

    for subtask in subtasks {
        let began_at = Utc::now();
        if failure.is_some() {
            record(ctx, scope, subtask.as_ref(), SubtaskOutcome::Skipped, None, began_at).await?;
            report
                .outcomes
                .push((subtask.name().to_string(), SubtaskOutcome::Skipped));
            continue;
        }

        info!(
            run_id = %ctx.run_id,
            stage = %subtask.stage(),
            subtask = subtask.name(),
            fingerprint = %scope.fingerprint,
            "starting subtask"
        );
        ctx.progress.report(ProgressEvent::Started {
            stage: subtask.stage(),
            subtask: subtask.name().to_string(),
            scope: scope.fingerprint.to_string(),
        });

        let result = if ctx.cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            tokio::select! {
                result = subtask.execute(ctx, scope) => result,
                _ = ctx.cancel.cancelled() => Err(PipelineError::Cancelled),
            }
        };

        let outcome = match &result {
            Ok(()) => SubtaskOutcome::Succeeded,
            Err(e) if e.is_cancelled() => SubtaskOutcome::Cancelled,
            Err(_) => SubtaskOutcome::Failed,
        };
        let message = result.as_ref().err().map(|e| e.to_string());
        record(ctx, scope, subtask.as_ref(), outcome, message, began_at).await?;
        report.outcomes.push((subtask.name().to_string(), outcome));

        match result {
            Ok(()) => info!(subtask = subtask.name(), "finished subtask"),
            Err(e) => {
                error!(subtask = subtask.name(), error = %e, "subtask failed");
                failure = Some(PipelineError::Subtask {
                    stage: subtask.stage(),
                    fingerprint: scope.fingerprint.to_string(),
                    source: Box::new(e),
                });
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(report),
    }
}

/// Run several scopes concurrently. Results come back in scope order.
pub async fn run_scopes(
    ctx: &TaskContext,
    scopes: Vec<Scope>,
    subtasks: Vec<Arc<dyn SubTask>>,
) -> Vec<Result<ScopeReport>> {
    let subtasks = Arc::new(subtasks);
    let mut set = JoinSet::new();
    for (index, scope) in scopes.into_iter().enumerate() {
        let ctx = ctx.clone();
        let subtasks = subtasks.clone();
        set.spawn(async move { (index, run_scope(&ctx, &scope, &subtasks).await) });
    }

    let mut results: Vec<Option<Result<ScopeReport>>> = Vec::new();
    results.resize_with(set.len(), || None);
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, result)) => results[index] = Some(result),
            Err(e) => warn!(error = %e, "scope task did not complete"),
        }
    }
    results
        .into_iter()
        .map(|r| r.unwrap_or_else(|| Err(PipelineError::Panicked("scope task aborted".into()))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lake_harness_core::store::memory::InMemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Step {
        name: &'static str,
        stage: Stage,
        fail_for: Option<u64>,
        runs: AtomicUsize,
    }

    impl Step {
        fn new(name: &'static str, stage: Stage, fail_for: Option<u64>) -> Arc<Self> {
            Arc::new(Self {
                name,
                stage,
                fail_for,
                runs: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SubTask for Step {
        fn name(&self) -> &str {
            self.name
        }

        fn stage(&self) -> Stage {
            self.stage
        }

        async fn execute(&self, _ctx: &TaskContext, scope: &Scope) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail_for.is_some() && scope.params["ProjectId"].as_u64() == self.fail_for {
                return Err(PipelineError::malformed("unexpected payload"));
            }
            Ok(())
        }
    }

    fn context(store: Arc<InMemoryStore>) -> TaskContext {
        TaskContext::new(
            "zentao",
            store,
            Arc::new(Config::minimal("unused.sqlite")),
        )
        .with_run_id("run-1")
    }

    #[tokio::test]
    async fn failure_skips_rest_of_scope_only() {
        let store = Arc::new(InMemoryStore::new());
        let ctx = context(store.clone());
        let collect = Step::new("collect_bugs", Stage::Collect, None);
        let extract = Step::new("extract_bugs", Stage::Extract, Some(2));
        let convert = Step::new("convert_bugs", Stage::Convert, None);
        let subtasks: Vec<Arc<dyn SubTask>> = vec![collect.clone(), extract.clone(), convert.clone()];

        let scopes = vec![
            Scope::new(json!({"ConnectionId": 1, "ProjectId": 1})).unwrap(),
            Scope::new(json!({"ConnectionId": 1, "ProjectId": 2})).unwrap(),
        ];
        let results = run_scopes(&ctx, scopes, subtasks).await;

        assert!(results[0].as_ref().unwrap().succeeded());
        match &results[1] {
            Err(PipelineError::Subtask { stage, .. }) => assert_eq!(*stage, Stage::Extract),
            other => panic!("expected subtask error, got {other:?}"),
        }
        assert_eq!(convert.runs.load(Ordering::SeqCst), 1);

        let statuses = store.list_subtask_statuses(Some("run-1")).await.unwrap();
        assert_eq!(statuses.len(), 6);
        let skipped: Vec<_> = statuses
            .iter()
            .filter(|s| s.outcome == SubtaskOutcome::Skipped)
            .collect();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].subtask, "convert_bugs");
        assert!(skipped[0].params.contains("\"ProjectId\":2"));
        let failed = statuses
            .iter()
            .find(|s| s.outcome == SubtaskOutcome::Failed)
            .unwrap();
        assert!(failed.message.as_deref().unwrap().contains("unexpected payload"));
    }

    #[tokio::test]
    async fn cancelled_run_records_cancellation() {
        let store = Arc::new(InMemoryStore::new());
        let cancel = CancelToken::new();
        cancel.cancel();
        let ctx = context(store.clone()).with_cancel(cancel);
        let subtasks: Vec<Arc<dyn SubTask>> = vec![
            Step::new("collect_bugs", Stage::Collect, None),
            Step::new("extract_bugs", Stage::Extract, None),
        ];
        let scope = Scope::new(json!({"ConnectionId": 1})).unwrap();
        let err = run_scope(&ctx, &scope, &subtasks).await.unwrap_err();
        assert!(err.is_cancelled());

        let statuses = store.list_subtask_statuses(None).await.unwrap();
        assert_eq!(statuses[0].outcome, SubtaskOutcome::Cancelled);
        assert_eq!(statuses[1].outcome, SubtaskOutcome::Skipped);
    }
}
