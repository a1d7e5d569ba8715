//! # Task Registry
//!
//! One row per (document, prompt, connection) unit of work within a batch.
//!
//! ## Overview
//!
//! The registry owns task status and timestamps. The four-tuple
//! `(batch_id, document_id, prompt_id, connection_id)` is a hard uniqueness
//! invariant enforced by a schema constraint; staging relies on it for
//! idempotency (`ON CONFLICT DO NOTHING`) rather than treating a duplicate
//! as an error.
//!
//! ## Claiming
//!
//! [`EvalTask::claim_next`] is the core concurrency contract: a single
//! `UPDATE ... WHERE status = 'QUEUED' ... FOR UPDATE SKIP LOCKED ...
//! RETURNING` statement. Concurrent workers can never double-claim because
//! the transition out of QUEUED happens inside one atomic statement, never
//! as read-then-write.
//!
//! ## Terminal transitions
//!
//! `complete` and `fail` only fire while the row is PROCESSING, so a second
//! call with the same task id is a no-op rather than an error. The sweeper
//! owns the remaining transitions (PROCESSING back to QUEUED on timeout,
//! FAILED to READY_TO_RETRY when queued siblings remain).

use crate::state_machine::TaskStatus;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct EvalTask {
    pub task_id: i64,
    pub batch_id: i64,
    pub document_id: i64,
    pub prompt_id: i64,
    pub connection_id: i64,
    pub status: String,
    /// Opaque external-evaluator reference, present only while PROCESSING
    pub task_handle: Option<String>,
    pub started_processing_at: Option<NaiveDateTime>,
    pub completed_processing_at: Option<NaiveDateTime>,
    pub score: Option<f64>,
    pub result_text: Option<String>,
    pub duration_ms: Option<i64>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Result payload reported by the evaluator for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskResult {
    pub score: Option<f64>,
    pub result_text: Option<String>,
    pub duration_ms: Option<i64>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
}

/// Per-batch status tally used for completion detection and reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusCounts {
    pub queued: i64,
    pub processing: i64,
    pub ready_to_retry: i64,
    pub completed: i64,
    pub failed: i64,
}

impl TaskStatusCounts {
    pub fn total(&self) -> i64 {
        self.queued + self.processing + self.ready_to_retry + self.completed + self.failed
    }

    /// Tasks that still have work ahead of them.
    pub fn non_terminal(&self) -> i64 {
        self.queued + self.processing + self.ready_to_retry
    }

    pub fn all_terminal(&self) -> bool {
        self.total() > 0 && self.non_terminal() == 0
    }
}

const TASK_COLUMNS: &str = r#"task_id, batch_id, document_id, prompt_id, connection_id, status,
    task_handle, started_processing_at, completed_processing_at, score, result_text,
    duration_ms, prompt_tokens, completion_tokens, error_message, created_at, updated_at"#;

impl EvalTask {
    pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<EvalTask>, sqlx::Error> {
        sqlx::query_as::<_, EvalTask>(&format!(
            "SELECT {TASK_COLUMNS} FROM eval_tasks WHERE task_id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// Create the document × prompt × connection cross-product for a batch.
    ///
    /// Idempotent: tuples that already exist are skipped via the uniqueness
    /// constraint, so re-staging after a partial failure fills only the gaps.
    /// Returns the number of rows actually inserted.
    pub async fn stage(
        pool: &PgPool,
        batch_id: i64,
        document_ids: &[i64],
        prompt_ids: &[i64],
        connection_ids: &[i64],
    ) -> Result<u64, sqlx::Error> {
        if document_ids.is_empty() || prompt_ids.is_empty() || connection_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO eval_tasks (batch_id, document_id, prompt_id, connection_id,
                                    status, created_at, updated_at)
            SELECT $1, d.document_id, p.prompt_id, c.connection_id, $5, NOW(), NOW()
            FROM UNNEST($2::BIGINT[]) AS d(document_id)
            CROSS JOIN UNNEST($3::BIGINT[]) AS p(prompt_id)
            CROSS JOIN UNNEST($4::BIGINT[]) AS c(connection_id)
            ON CONFLICT (batch_id, document_id, prompt_id, connection_id) DO NOTHING
            "#,
        )
        .bind(batch_id)
        .bind(document_ids)
        .bind(prompt_ids)
        .bind(connection_ids)
        .bind(TaskStatus::Queued.to_string())
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Atomically claim up to `limit` QUEUED tasks, moving them to
    /// PROCESSING and stamping `started_processing_at`.
    ///
    /// `FOR UPDATE SKIP LOCKED` keeps concurrent claimers from blocking on
    /// or double-claiming the same rows.
    pub async fn claim_next(
        pool: &PgPool,
        batch_id: i64,
        limit: i64,
    ) -> Result<Vec<EvalTask>, sqlx::Error> {
        sqlx::query_as::<_, EvalTask>(&format!(
            r#"
            UPDATE eval_tasks
            SET status = $3, started_processing_at = NOW(), updated_at = NOW()
            WHERE task_id IN (
                SELECT task_id FROM eval_tasks
                WHERE batch_id = $1 AND status = $4
                ORDER BY task_id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(batch_id)
        .bind(limit)
        .bind(TaskStatus::Processing.to_string())
        .bind(TaskStatus::Queued.to_string())
        .fetch_all(pool)
        .await
    }

    /// Record the evaluator handle for a claimed task.
    pub async fn set_task_handle(
        pool: &PgPool,
        task_id: i64,
        handle: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE eval_tasks SET task_handle = $2, updated_at = NOW() WHERE task_id = $1",
        )
        .bind(task_id)
        .bind(handle)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Release a claimed task back to QUEUED after a dispatch failure so the
    /// next wave retries it instead of orphaning it.
    pub async fn release_claim(pool: &PgPool, task_id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE eval_tasks
            SET status = $2, task_handle = NULL, started_processing_at = NULL, updated_at = NOW()
            WHERE task_id = $1 AND status = $3
            "#,
        )
        .bind(task_id)
        .bind(TaskStatus::Queued.to_string())
        .bind(TaskStatus::Processing.to_string())
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// PROCESSING -> COMPLETED with the result payload. Idempotent: a second
    /// call finds the row no longer PROCESSING and does nothing.
    pub async fn complete(
        pool: &PgPool,
        task_id: i64,
        result: &TaskResult,
    ) -> Result<bool, sqlx::Error> {
        let outcome = sqlx::query(
            r#"
            UPDATE eval_tasks
            SET status = $2, completed_processing_at = NOW(), updated_at = NOW(),
                score = $3, result_text = $4, duration_ms = $5,
                prompt_tokens = $6, completion_tokens = $7, error_message = NULL
            WHERE task_id = $1 AND status = $8
            "#,
        )
        .bind(task_id)
        .bind(TaskStatus::Completed.to_string())
        .bind(result.score)
        .bind(&result.result_text)
        .bind(result.duration_ms)
        .bind(result.prompt_tokens)
        .bind(result.completion_tokens)
        .bind(TaskStatus::Processing.to_string())
        .execute(pool)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    /// PROCESSING -> FAILED with the error message. Idempotent like
    /// [`EvalTask::complete`].
    pub async fn fail(
        pool: &PgPool,
        task_id: i64,
        error_message: &str,
    ) -> Result<bool, sqlx::Error> {
        let outcome = sqlx::query(
            r#"
            UPDATE eval_tasks
            SET status = $2, completed_processing_at = NOW(), updated_at = NOW(),
                error_message = $3
            WHERE task_id = $1 AND status = $4
            "#,
        )
        .bind(task_id)
        .bind(TaskStatus::Failed.to_string())
        .bind(error_message)
        .bind(TaskStatus::Processing.to_string())
        .execute(pool)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    /// Tally task statuses for a batch.
    pub async fn status_counts(
        pool: &PgPool,
        batch_id: i64,
    ) -> Result<TaskStatusCounts, sqlx::Error> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT status, COUNT(*) FROM eval_tasks
            WHERE batch_id = $1
            GROUP BY status
            "#,
        )
        .bind(batch_id)
        .fetch_all(pool)
        .await?;

        let mut counts = TaskStatusCounts::default();
        for (status, count) in rows {
            match status.parse::<TaskStatus>() {
                Ok(TaskStatus::Queued) => counts.queued = count,
                Ok(TaskStatus::Processing) => counts.processing = count,
                Ok(TaskStatus::ReadyToRetry) => counts.ready_to_retry = count,
                Ok(TaskStatus::Completed) => counts.completed = count,
                Ok(TaskStatus::Failed) => counts.failed = count,
                Err(_) => {}
            }
        }
        Ok(counts)
    }

    /// Error messages of FAILED tasks, for batch-granularity failure reports.
    pub async fn failed_task_errors(
        pool: &PgPool,
        batch_id: i64,
    ) -> Result<Vec<(i64, String)>, sqlx::Error> {
        let rows = sqlx::query_as::<_, (i64, Option<String>)>(
            r#"
            SELECT task_id, error_message FROM eval_tasks
            WHERE batch_id = $1 AND status = $2
            ORDER BY task_id
            "#,
        )
        .bind(batch_id)
        .bind(TaskStatus::Failed.to_string())
        .fetch_all(pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, msg)| (id, msg.unwrap_or_else(|| "unknown error".to_string())))
            .collect())
    }

    /// Maintenance: collapse duplicate rows sharing a
    /// `(document_id, prompt_id, connection_id)` tuple within a batch,
    /// keeping the lowest task_id. Duplicates predate the uniqueness
    /// constraint; the write path can no longer create them. Safe to run
    /// concurrently with staging of a different batch.
    pub async fn dedupe(pool: &PgPool, batch_id: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM eval_tasks t
            USING eval_tasks keep
            WHERE t.batch_id = $1
              AND keep.batch_id = t.batch_id
              AND keep.document_id = t.document_id
              AND keep.prompt_id = t.prompt_id
              AND keep.connection_id = t.connection_id
              AND keep.task_id < t.task_id
            "#,
        )
        .bind(batch_id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Sweeper repair: reset PROCESSING tasks whose claim predates `cutoff`
    /// back to QUEUED with handle and start time cleared. Returns the ids of
    /// the reset tasks.
    pub async fn reset_stale_processing(
        pool: &PgPool,
        cutoff: NaiveDateTime,
    ) -> Result<Vec<i64>, sqlx::Error> {
        let rows = sqlx::query_as::<_, (i64,)>(
            r#"
            UPDATE eval_tasks
            SET status = $2, task_handle = NULL, started_processing_at = NULL, updated_at = NOW()
            WHERE status = $3 AND started_processing_at < $1
            RETURNING task_id
            "#,
        )
        .bind(cutoff)
        .bind(TaskStatus::Queued.to_string())
        .bind(TaskStatus::Processing.to_string())
        .fetch_all(pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Sweeper repair: FAILED tasks in batches that still have QUEUED
    /// siblings become READY_TO_RETRY, so an operator retry pass can
    /// re-attempt them without re-staging the whole batch.
    pub async fn promote_failed_with_queued_siblings(
        pool: &PgPool,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE eval_tasks t
            SET status = $1, updated_at = NOW()
            WHERE t.status = $2
              AND EXISTS (
                  SELECT 1 FROM eval_tasks q
                  WHERE q.batch_id = t.batch_id AND q.status = $3
              )
            "#,
        )
        .bind(TaskStatus::ReadyToRetry.to_string())
        .bind(TaskStatus::Failed.to_string())
        .bind(TaskStatus::Queued.to_string())
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Operator retry pass: READY_TO_RETRY -> QUEUED with the stale error
    /// cleared, making the tasks claimable again.
    pub async fn requeue_retryable(pool: &PgPool, batch_id: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE eval_tasks
            SET status = $2, error_message = NULL, task_handle = NULL,
                started_processing_at = NULL, completed_processing_at = NULL,
                updated_at = NOW()
            WHERE batch_id = $1 AND status = $3
            "#,
        )
        .bind(batch_id)
        .bind(TaskStatus::Queued.to_string())
        .bind(TaskStatus::ReadyToRetry.to_string())
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Coarse cancellation: fail every task still waiting for dispatch,
    /// QUEUED and READY_TO_RETRY alike, so the batch can reach a terminal
    /// status. In-flight tasks are never interrupted; they finish on their
    /// own.
    pub async fn fail_queued(
        pool: &PgPool,
        batch_id: i64,
        error_message: &str,
    ) -> Result<u64, sqlx::Error> {
        let waiting = vec![
            TaskStatus::Queued.to_string(),
            TaskStatus::ReadyToRetry.to_string(),
        ];

        let result = sqlx::query(
            r#"
            UPDATE eval_tasks
            SET status = $2, error_message = $3, completed_processing_at = NOW(),
                updated_at = NOW()
            WHERE batch_id = $1 AND status = ANY($4)
            "#,
        )
        .bind(batch_id)
        .bind(TaskStatus::Failed.to_string())
        .bind(error_message)
        .bind(&waiting)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Staging rollback: remove every task for a batch.
    pub async fn delete_for_batch(pool: &PgPool, batch_id: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM eval_tasks WHERE batch_id = $1")
            .bind(batch_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
