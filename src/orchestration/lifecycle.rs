//! # Batch Lifecycle
//!
//! Drives a batch through its lifecycle stages and owns every batch-level
//! status change outside the recovery sweeper.
//!
//! ## Staging
//!
//! `stage_batch` is all-or-nothing at the batch level: on any error the
//! partial task set is deleted, claimed documents are released, staged
//! content is purged, and the batch returns to SAVED. The underlying task
//! insert is idempotent, so a retried staging run fills only the gaps.
//!
//! ## Running
//!
//! `run_batch` claims QUEUED tasks in bounded waves and hands them to the
//! dispatcher. Re-running a batch that is already PROCESSING is a no-op that
//! only dispatches newly-QUEUED tasks, which is exactly the re-entry point
//! needed after a partial dispatch failure or a sweeper repair.
//!
//! ## Completion
//!
//! Terminal aggregation is count-driven: zero non-terminal tasks moves the
//! batch to COMPLETED, or FAILED when any task failed. Per-task failures
//! never abort a batch mid-flight.

use crate::config::EngineConfig;
use crate::content::codec::ContentCodec;
use crate::content::store::{ContentKey, ContentStore, ContentStoreError};
use crate::models::{Batch, Document, EvalTask, NewBatch, TaskResult};
use crate::orchestration::dispatcher::{DispatchError, TaskDispatcher};
use crate::registry::ConfigRegistry;
use crate::state_machine::{BatchEvent, BatchStateMachine, BatchStatus, StateMachineError};
use async_trait::async_trait;
use sqlx::PgPool;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Supplies raw document bytes during staging. Folder walking and document
/// ingestion live outside the engine; this seam only resolves one already
/// ingested document to its bytes.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn read(&self, document: &Document) -> std::io::Result<Vec<u8>>;
}

/// Default source reading the ingested filepath from local disk.
#[derive(Debug, Default, Clone)]
pub struct FsDocumentSource;

#[async_trait]
impl DocumentSource for FsDocumentSource {
    async fn read(&self, document: &Document) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(Path::new(&document.filepath)).await
    }
}

/// Errors surfaced by lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error(transparent)]
    Content(#[from] ContentStoreError),

    #[error("failed to read document {document_id} from source: {message}")]
    DocumentRead { document_id: i64, message: String },

    #[error("batch {0} has no config snapshot")]
    MissingSnapshot(i64),

    #[error("config snapshot for batch {0} has no connections or no prompts")]
    EmptySnapshot(i64),

    #[error("batch not found: {0}")]
    BatchNotFound(i64),

    #[error("task not found: {0}")]
    TaskNotFound(i64),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Batch-granularity failure report: the count plus each task's own error,
/// never a single opaque message.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BatchFailureReport {
    pub batch_id: i64,
    pub status: String,
    pub failed_tasks: i64,
    pub errors: Vec<TaskFailure>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskFailure {
    pub task_id: i64,
    pub error_message: String,
}

/// Drives batches through their lifecycle.
pub struct BatchLifecycle {
    pool: PgPool,
    content_store: Arc<dyn ContentStore>,
    registry: Arc<ConfigRegistry>,
    document_source: Arc<dyn DocumentSource>,
    dispatcher: Arc<TaskDispatcher>,
    state_machine: BatchStateMachine,
    codec: ContentCodec,
    config: EngineConfig,
}

impl BatchLifecycle {
    pub fn new(
        pool: PgPool,
        content_store: Arc<dyn ContentStore>,
        registry: Arc<ConfigRegistry>,
        document_source: Arc<dyn DocumentSource>,
        dispatcher: Arc<TaskDispatcher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            state_machine: BatchStateMachine::new(pool.clone()),
            pool,
            content_store,
            registry,
            document_source,
            dispatcher,
            codec: ContentCodec::new(),
            config,
        }
    }

    /// Create a SAVED batch, snapshotting the live configuration exactly
    /// once. Later edits to connections or prompts cannot touch this batch.
    #[instrument(skip(self))]
    pub async fn create_batch(
        &self,
        name: &str,
        folder_ids: &[i64],
    ) -> Result<Batch, StagingError> {
        let snapshot = self.registry.snapshot();
        let batch = Batch::create(
            &self.pool,
            NewBatch {
                name: name.to_string(),
                folder_ids: folder_ids.to_vec(),
                config_snapshot: snapshot,
            },
        )
        .await?;

        info!(batch_id = batch.batch_id, name, "Created batch");
        Ok(batch)
    }

    /// SAVED -> STAGING -> STAGED, rolling back to SAVED on any error.
    #[instrument(skip(self))]
    pub async fn stage_batch(&self, batch_id: i64) -> Result<Batch, StagingError> {
        self.state_machine
            .transition(batch_id, BatchEvent::Stage)
            .await?;

        match self.populate_tasks(batch_id).await {
            Ok(total_documents) => {
                Batch::set_total_documents(&self.pool, batch_id, total_documents).await?;
                self.state_machine
                    .transition(batch_id, BatchEvent::StageSucceeded)
                    .await?;

                info!(batch_id, total_documents, "Batch staged");
                let batch = Batch::find_by_id(&self.pool, batch_id)
                    .await?
                    .ok_or(StagingError::BatchNotFound(batch_id))?;
                Ok(batch)
            }
            Err(e) => {
                warn!(batch_id, error = %e, "Staging failed, rolling back");
                self.rollback_staging(batch_id).await?;
                self.state_machine
                    .transition(batch_id, BatchEvent::StageFailed(e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    /// Resolve the document set, persist encoded content, and populate the
    /// task cross-product. Returns the resolved document count.
    async fn populate_tasks(&self, batch_id: i64) -> Result<i32, StagingError> {
        let batch = Batch::find_by_id(&self.pool, batch_id)
            .await?
            .ok_or(StagingError::BatchNotFound(batch_id))?;

        // The snapshot is written at creation; older rows staged before that
        // convention get one here, still exactly once.
        let snapshot = match batch.snapshot() {
            Some(s) => s,
            None => {
                let snapshot = self.registry.snapshot();
                Batch::set_config_snapshot_if_absent(&self.pool, batch_id, &snapshot).await?;
                Batch::find_by_id(&self.pool, batch_id)
                    .await?
                    .and_then(|b| b.snapshot())
                    .ok_or(StagingError::MissingSnapshot(batch_id))?
            }
        };

        if snapshot.is_empty() {
            return Err(StagingError::EmptySnapshot(batch_id));
        }

        // Claim unassigned documents from the batch's folders; documents
        // already owned by this batch (a previous partial staging) are
        // picked up again by the conditional update.
        let candidates =
            Document::list_unassigned_in_folders(&self.pool, &batch.folder_ids).await?;
        let candidate_ids: Vec<i64> = candidates.iter().map(|d| d.document_id).collect();
        Document::assign_to_batch(&self.pool, batch_id, &candidate_ids).await?;

        let documents = Document::list_for_batch(&self.pool, batch_id).await?;

        for document in &documents {
            let key = ContentKey::document(batch_id, document.document_id);
            let bytes = self
                .document_source
                .read(document)
                .await
                .map_err(|e| StagingError::DocumentRead {
                    document_id: document.document_id,
                    message: e.to_string(),
                })?;
            let encoded = self.codec.encode(&bytes);
            self.content_store
                .put(&key, &encoded, bytes.len() as i64)
                .await?;
        }

        let document_ids: Vec<i64> = documents.iter().map(|d| d.document_id).collect();
        let created = EvalTask::stage(
            &self.pool,
            batch_id,
            &document_ids,
            &snapshot.prompt_ids(),
            &snapshot.connection_ids(),
        )
        .await?;

        debug!(
            batch_id,
            documents = documents.len(),
            tasks_created = created,
            "Populated task registry"
        );

        Ok(documents.len() as i32)
    }

    /// Discard partial staging state: tasks, document ownership, content.
    async fn rollback_staging(&self, batch_id: i64) -> Result<(), StagingError> {
        EvalTask::delete_for_batch(&self.pool, batch_id).await?;
        Document::release_for_batch(&self.pool, batch_id).await?;
        self.content_store.delete_batch(batch_id).await?;
        Ok(())
    }

    /// Dispatch QUEUED tasks in bounded waves. Requires STAGED (first run)
    /// or PROCESSING/ANALYZING (resume); advances to PROCESSING on the first
    /// successful dispatch.
    #[instrument(skip(self))]
    pub async fn run_batch(&self, batch_id: i64) -> Result<(), StagingError> {
        let batch = Batch::find_by_id(&self.pool, batch_id)
            .await?
            .ok_or(StagingError::BatchNotFound(batch_id))?;
        let status = batch
            .batch_status()
            .map_err(StateMachineError::CorruptStatus)?;

        if !status.is_dispatchable() {
            return Err(StagingError::StateMachine(
                StateMachineError::InvalidTransition {
                    from: status,
                    event: BatchEvent::Run,
                },
            ));
        }

        let snapshot = batch
            .snapshot()
            .ok_or(StagingError::MissingSnapshot(batch_id))?;

        let mut dispatched_any = false;
        loop {
            let outcome = self
                .dispatcher
                .dispatch_wave(batch_id, &snapshot, self.config.dispatch_wave_size)
                .await?;

            if outcome.dispatched > 0 && !dispatched_any {
                dispatched_any = true;
                if status == BatchStatus::Staged {
                    // Concurrent runners race here; losing is benign since
                    // the winner made the same transition.
                    match self.state_machine.transition(batch_id, BatchEvent::Run).await {
                        Ok(_) | Err(StateMachineError::LostRace { .. }) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }

            if outcome.claimed == 0 || outcome.evaluator_unavailable {
                break;
            }
        }

        self.finalize_if_complete(batch_id).await?;
        Ok(())
    }

    /// Re-entry point for evaluator callbacks and pollers: record a task
    /// outcome and re-check batch completion.
    #[instrument(skip(self, outcome))]
    pub async fn record_result(
        &self,
        task_id: i64,
        outcome: Result<TaskResult, String>,
    ) -> Result<(), StagingError> {
        let task = EvalTask::find_by_id(&self.pool, task_id)
            .await?
            .ok_or(StagingError::TaskNotFound(task_id))?;

        let applied = match outcome {
            Ok(result) => {
                let applied = EvalTask::complete(&self.pool, task_id, &result).await?;
                if applied {
                    self.dispatcher.archive_result(&task, &result).await;
                }
                applied
            }
            Err(message) => EvalTask::fail(&self.pool, task_id, &message).await?,
        };

        if !applied {
            // Already terminal: a duplicate callback or a sweeper reset won
            debug!(task_id, "Result arrived for a task no longer PROCESSING; ignoring");
        }

        self.finalize_if_complete(task.batch_id).await?;
        Ok(())
    }

    /// Count-driven terminal transition: zero non-terminal tasks moves the
    /// batch to COMPLETED or FAILED. Also refreshes the processed-documents
    /// counter. Safe to call at any time.
    pub async fn finalize_if_complete(&self, batch_id: i64) -> Result<bool, StagingError> {
        let counts = EvalTask::status_counts(&self.pool, batch_id).await?;
        Batch::refresh_processed_documents(&self.pool, batch_id).await?;

        if !counts.all_terminal() {
            return Ok(false);
        }

        let batch = Batch::find_by_id(&self.pool, batch_id)
            .await?
            .ok_or(StagingError::BatchNotFound(batch_id))?;
        let status = batch
            .batch_status()
            .map_err(StateMachineError::CorruptStatus)?;
        if status.is_terminal() {
            return Ok(true);
        }

        let event = if counts.failed > 0 {
            BatchEvent::Fail(format!("{} task(s) failed", counts.failed))
        } else {
            BatchEvent::Complete
        };

        match self.state_machine.transition(batch_id, event).await {
            Ok(final_status) => {
                info!(
                    batch_id,
                    status = %final_status,
                    completed = counts.completed,
                    failed = counts.failed,
                    "Batch reached terminal status"
                );
                Ok(true)
            }
            // Another worker finalized first
            Err(StateMachineError::LostRace { .. }) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Coarse cancellation: stop claiming by failing every task still
    /// waiting for dispatch (QUEUED or READY_TO_RETRY); in-flight tasks
    /// finish on their own.
    #[instrument(skip(self))]
    pub async fn cancel_batch(&self, batch_id: i64) -> Result<u64, StagingError> {
        let cancelled =
            EvalTask::fail_queued(&self.pool, batch_id, "batch cancelled by operator").await?;
        info!(batch_id, cancelled, "Cancelled remaining queued tasks");
        self.finalize_if_complete(batch_id).await?;
        Ok(cancelled)
    }

    /// Operator retry pass: make READY_TO_RETRY tasks claimable again. The
    /// caller follows up with [`BatchLifecycle::run_batch`] to dispatch them.
    #[instrument(skip(self))]
    pub async fn retry_failed_tasks(&self, batch_id: i64) -> Result<u64, StagingError> {
        let requeued = EvalTask::requeue_retryable(&self.pool, batch_id).await?;
        info!(batch_id, requeued, "Requeued retryable tasks");
        Ok(requeued)
    }

    /// User-visible failure report at batch granularity.
    pub async fn failure_report(&self, batch_id: i64) -> Result<BatchFailureReport, StagingError> {
        let batch = Batch::find_by_id(&self.pool, batch_id)
            .await?
            .ok_or(StagingError::BatchNotFound(batch_id))?;
        let errors = EvalTask::failed_task_errors(&self.pool, batch_id).await?;

        Ok(BatchFailureReport {
            batch_id,
            status: batch.status,
            failed_tasks: errors.len() as i64,
            errors: errors
                .into_iter()
                .map(|(task_id, error_message)| TaskFailure {
                    task_id,
                    error_message,
                })
                .collect(),
        })
    }
}
