//! # Task Dispatcher
//!
//! Claims QUEUED tasks in bounded waves and hands each one to the external
//! evaluator.
//!
//! ## Failure semantics
//!
//! A dispatch failure must never orphan a task. When the evaluator is
//! unreachable the claimed task is released back to QUEUED so the next wave
//! (or another worker) retries it; only an evaluator-reported per-task
//! failure marks the task FAILED. There is no in-process lock anywhere in
//! this path: the atomic claim is the whole concurrency story.

use crate::content::codec::ContentCodec;
use crate::content::store::{ContentKey, ContentStore};
use crate::models::{ConfigSnapshot, EvalTask, TaskResult};
use crate::orchestration::evaluator::{
    EvaluationRequest, EvaluationResponse, Evaluator, EvaluatorError,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("task {task_id} references missing snapshot entry: {missing}")]
    SnapshotGap { task_id: i64, missing: String },
}

/// What one wave accomplished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Tasks atomically claimed this wave
    pub claimed: usize,
    /// Claims that reached the evaluator (sync result, async handle, or a
    /// per-task failure report)
    pub dispatched: usize,
    /// Claims released back to QUEUED because the evaluator was unreachable
    pub released: usize,
    /// Whether the wave ended early on evaluator unavailability
    pub evaluator_unavailable: bool,
}

/// Wave-based dispatcher over the task registry.
pub struct TaskDispatcher {
    pool: PgPool,
    evaluator: Arc<dyn Evaluator>,
    content_store: Arc<dyn ContentStore>,
    codec: ContentCodec,
    /// Identifies this worker in logs when several run side by side
    worker_id: String,
}

impl TaskDispatcher {
    pub fn new(
        pool: PgPool,
        evaluator: Arc<dyn Evaluator>,
        content_store: Arc<dyn ContentStore>,
    ) -> Self {
        Self {
            pool,
            evaluator,
            content_store,
            codec: ContentCodec::new(),
            worker_id: format!("dispatcher-{}", Uuid::new_v4()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim up to `limit` QUEUED tasks of the batch and dispatch them.
    #[instrument(skip(self, snapshot), fields(worker_id = %self.worker_id))]
    pub async fn dispatch_wave(
        &self,
        batch_id: i64,
        snapshot: &ConfigSnapshot,
        limit: i64,
    ) -> Result<DispatchOutcome, DispatchError> {
        let claimed = EvalTask::claim_next(&self.pool, batch_id, limit).await?;
        let mut outcome = DispatchOutcome {
            claimed: claimed.len(),
            ..Default::default()
        };

        if claimed.is_empty() {
            debug!(batch_id, "No queued tasks to claim");
            return Ok(outcome);
        }

        debug!(batch_id, claimed = claimed.len(), "Claimed dispatch wave");

        for task in claimed {
            match self.dispatch_task(&task, snapshot).await {
                Ok(true) => outcome.dispatched += 1,
                Ok(false) => {
                    outcome.released += 1;
                    outcome.evaluator_unavailable = true;
                }
                Err(e) => {
                    // Snapshot gaps are per-task data problems, not
                    // evaluator weather; the task is failed with the cause
                    warn!(task_id = task.task_id, error = %e, "Failing undispatchable task");
                    EvalTask::fail(&self.pool, task.task_id, &e.to_string()).await?;
                    outcome.dispatched += 1;
                }
            }
        }

        if outcome.evaluator_unavailable {
            warn!(
                batch_id,
                released = outcome.released,
                "Evaluator unavailable; released remaining claims to QUEUED"
            );
        }

        Ok(outcome)
    }

    /// Dispatch one claimed task. Returns `Ok(false)` when the evaluator was
    /// unreachable and the claim was released.
    async fn dispatch_task(
        &self,
        task: &EvalTask,
        snapshot: &ConfigSnapshot,
    ) -> Result<bool, DispatchError> {
        let connection = snapshot.connection(task.connection_id).ok_or_else(|| {
            DispatchError::SnapshotGap {
                task_id: task.task_id,
                missing: format!("connection {}", task.connection_id),
            }
        })?;
        let prompt = snapshot.prompt(task.prompt_id).ok_or_else(|| {
            DispatchError::SnapshotGap {
                task_id: task.task_id,
                missing: format!("prompt {}", task.prompt_id),
            }
        })?;

        let request = EvaluationRequest {
            task_id: task.task_id,
            content_key: ContentKey::document(task.batch_id, task.document_id).to_string(),
            prompt_text: prompt.prompt_text.clone(),
            connection: connection.clone(),
        };

        match self.evaluator.evaluate(request).await {
            Ok(EvaluationResponse::Completed(result)) => {
                EvalTask::complete(&self.pool, task.task_id, &result).await?;
                self.archive_result(task, &result).await;
                debug!(task_id = task.task_id, "Task completed synchronously");
                Ok(true)
            }
            Ok(EvaluationResponse::Accepted { task_handle }) => {
                EvalTask::set_task_handle(&self.pool, task.task_id, &task_handle).await?;
                debug!(task_id = task.task_id, handle = %task_handle, "Task accepted for async evaluation");
                Ok(true)
            }
            Ok(EvaluationResponse::Failed { error_message }) => {
                EvalTask::fail(&self.pool, task.task_id, &error_message).await?;
                info!(task_id = task.task_id, "Evaluator reported task failure");
                Ok(true)
            }
            Err(EvaluatorError::Unavailable(message)) => {
                // Leave the task QUEUED, not PROCESSING, so the next wave
                // retries instead of orphaning it
                EvalTask::release_claim(&self.pool, task.task_id).await?;
                warn!(task_id = task.task_id, %message, "Evaluator unavailable; claim released");
                Ok(false)
            }
            Err(EvaluatorError::InvalidRequest(message)) => {
                EvalTask::fail(&self.pool, task.task_id, &message).await?;
                error!(task_id = task.task_id, %message, "Evaluator rejected request");
                Ok(true)
            }
        }
    }

    /// Archive full result detail in the content plane. The control-plane
    /// columns are authoritative; a content-plane write failure is logged
    /// and never fails the task.
    pub(crate) async fn archive_result(&self, task: &EvalTask, result: &TaskResult) {
        let key = ContentKey::task_result(task.batch_id, task.task_id);
        let bytes = match serde_json::to_vec(result) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(task_id = task.task_id, error = %e, "Could not serialize result detail");
                return;
            }
        };

        let encoded = self.codec.encode(&bytes);
        if let Err(e) = self
            .content_store
            .put(&key, &encoded, bytes.len() as i64)
            .await
        {
            warn!(task_id = task.task_id, error = %e, "Failed to archive result detail");
        }
    }
}
