//! # Recovery Sweeper
//!
//! Startup and interval procedure that finds batches and tasks stranded in
//! transient states by crashed workers and repairs them.
//!
//! ## Repairs
//!
//! Two independent passes, each safe to run concurrently with live dispatch:
//!
//! - **Stuck batches**: a batch sitting in STAGING past the staleness
//!   threshold had its staging worker die; partial staging is discarded and
//!   the batch returns to SAVED. A stale PROCESSING/ANALYZING batch with
//!   zero pending tasks missed its terminal transition and is finalized;
//!   one with pending tasks is left alone but logged for operator attention.
//! - **Stuck tasks**: a task PROCESSING past the threshold is assumed lost
//!   by the evaluator and reset to QUEUED with its handle cleared, so the
//!   next claim wave re-dispatches it. FAILED tasks whose batch still has
//!   QUEUED siblings are promoted to READY_TO_RETRY for an operator retry
//!   pass.

use crate::config::EngineConfig;
use crate::content::store::ContentStore;
use crate::models::{Batch, Document, EvalTask};
use crate::state_machine::{BatchEvent, BatchStateMachine, BatchStatus, StateMachineError};
use chrono::{Duration, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// What one sweep repaired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stale_batches_seen: usize,
    pub staging_rolled_back: usize,
    pub batches_finalized: usize,
    pub batches_left_running: usize,
    pub tasks_requeued: usize,
    pub tasks_promoted_to_retry: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error("content store error: {0}")]
    Content(String),
}

/// Background repair procedure for stuck batches and tasks.
pub struct RecoverySweeper {
    pool: PgPool,
    content_store: Arc<dyn ContentStore>,
    state_machine: BatchStateMachine,
    config: EngineConfig,
    sweeper_id: String,
}

impl RecoverySweeper {
    pub fn new(pool: PgPool, content_store: Arc<dyn ContentStore>, config: EngineConfig) -> Self {
        Self {
            state_machine: BatchStateMachine::new(pool.clone()),
            pool,
            content_store,
            config,
            sweeper_id: format!("sweeper-{}", Uuid::new_v4()),
        }
    }

    /// One full sweep: stuck tasks first so the batch pass sees accurate
    /// pending counts, then stuck batches, then retry promotion.
    #[instrument(skip(self), fields(sweeper_id = %self.sweeper_id))]
    pub async fn run_once(&self) -> Result<SweepReport, RecoveryError> {
        let mut report = SweepReport::default();

        self.sweep_stuck_tasks(&mut report).await?;
        self.sweep_stuck_batches(&mut report).await?;

        report.tasks_promoted_to_retry =
            EvalTask::promote_failed_with_queued_siblings(&self.pool).await?;

        if report != SweepReport::default() {
            info!(
                stale_batches = report.stale_batches_seen,
                staging_rolled_back = report.staging_rolled_back,
                batches_finalized = report.batches_finalized,
                tasks_requeued = report.tasks_requeued,
                tasks_promoted = report.tasks_promoted_to_retry,
                "Recovery sweep repaired stuck work"
            );
        }

        Ok(report)
    }

    async fn sweep_stuck_tasks(&self, report: &mut SweepReport) -> Result<(), RecoveryError> {
        let cutoff =
            (Utc::now() - Duration::seconds(self.config.task_staleness_secs)).naive_utc();

        let reset = EvalTask::reset_stale_processing(&self.pool, cutoff).await?;
        if !reset.is_empty() {
            warn!(
                count = reset.len(),
                task_ids = ?reset,
                threshold_secs = self.config.task_staleness_secs,
                "Reset stale PROCESSING tasks to QUEUED; evaluator presumed to have lost them"
            );
        }
        report.tasks_requeued = reset.len();
        Ok(())
    }

    async fn sweep_stuck_batches(&self, report: &mut SweepReport) -> Result<(), RecoveryError> {
        let cutoff =
            (Utc::now() - Duration::seconds(self.config.batch_staleness_secs)).naive_utc();

        let stale = Batch::list_stale_transient(&self.pool, cutoff).await?;
        report.stale_batches_seen = stale.len();

        for batch in stale {
            let status: BatchStatus = match batch.status.parse() {
                Ok(s) => s,
                Err(e) => {
                    warn!(batch_id = batch.batch_id, error = %e, "Skipping batch with corrupt status");
                    continue;
                }
            };

            match status {
                BatchStatus::Staging => {
                    self.rollback_stuck_staging(batch.batch_id).await?;
                    report.staging_rolled_back += 1;
                }
                BatchStatus::Processing | BatchStatus::Analyzing => {
                    if self.finalize_stuck_run(&batch).await? {
                        report.batches_finalized += 1;
                    } else {
                        report.batches_left_running += 1;
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// STAGING past the threshold: the staging worker died mid-flight.
    /// Discard partial work and return the batch to SAVED.
    async fn rollback_stuck_staging(&self, batch_id: i64) -> Result<(), RecoveryError> {
        warn!(batch_id, "Rolling back stuck STAGING batch to SAVED");

        EvalTask::delete_for_batch(&self.pool, batch_id).await?;
        Document::release_for_batch(&self.pool, batch_id).await?;
        self.content_store
            .delete_batch(batch_id)
            .await
            .map_err(|e| RecoveryError::Content(e.to_string()))?;

        match self
            .state_machine
            .transition(batch_id, BatchEvent::Reset)
            .await
        {
            Ok(_) | Err(StateMachineError::LostRace { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stale PROCESSING/ANALYZING: finalize when nothing is pending, using
    /// the same terminal rule as the lifecycle; otherwise leave it running
    /// but flag it for an operator.
    async fn finalize_stuck_run(&self, batch: &Batch) -> Result<bool, RecoveryError> {
        let counts = EvalTask::status_counts(&self.pool, batch.batch_id).await?;

        if !counts.all_terminal() {
            warn!(
                batch_id = batch.batch_id,
                status = %batch.status,
                pending = counts.non_terminal(),
                threshold_secs = self.config.batch_staleness_secs,
                "Stale batch still has pending tasks; leaving for operator attention"
            );
            return Ok(false);
        }

        Batch::refresh_processed_documents(&self.pool, batch.batch_id).await?;

        let event = if counts.failed > 0 {
            BatchEvent::Fail(format!("{} task(s) failed", counts.failed))
        } else {
            BatchEvent::Complete
        };

        match self.state_machine.transition(batch.batch_id, event).await {
            Ok(final_status) => {
                info!(
                    batch_id = batch.batch_id,
                    status = %final_status,
                    "Finalized stuck batch that had missed its terminal transition"
                );
                Ok(true)
            }
            Err(StateMachineError::LostRace { .. }) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Run forever: once immediately at startup, then on the configured
    /// interval. Sweep errors are logged and the loop continues.
    pub async fn run_loop(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.config.sweeper_interval_secs));

        loop {
            ticker.tick().await;
            if let Err(e) = self.run_once().await {
                warn!(sweeper_id = %self.sweeper_id, error = %e, "Recovery sweep failed; will retry next interval");
            }
        }
    }
}
