//! # Batch Model
//!
//! The batch row is the durable record of one bulk evaluation run: which
//! folders it draws from, the frozen configuration it runs against, its
//! lifecycle status, and its progress counters.
//!
//! ## Key invariants
//!
//! - `config_snapshot` is written once at creation and never regenerated;
//!   [`Batch::set_config_snapshot_if_absent`] is guarded so a second write
//!   is a no-op.
//! - Status changes go through conditional updates
//!   ([`Batch::transition_status`]) so concurrent writers converge on
//!   last-writer-wins without ever skipping a guard.
//! - Batches are never physically deleted while tasks reference them.

use crate::models::ConfigSnapshot;
use crate::state_machine::BatchStatus;
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Batch {
    pub batch_id: i64,
    pub name: String,
    pub folder_ids: Vec<i64>,
    pub config_snapshot: Option<serde_json::Value>,
    pub status: String,
    pub total_documents: i32,
    pub processed_documents: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub started_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
}

/// New batch for creation (without generated fields)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBatch {
    pub name: String,
    pub folder_ids: Vec<i64>,
    pub config_snapshot: ConfigSnapshot,
}

const BATCH_COLUMNS: &str = r#"batch_id, name, folder_ids, config_snapshot, status,
    total_documents, processed_documents, created_at, updated_at, started_at, completed_at"#;

impl Batch {
    /// Create a new SAVED batch with its config snapshot embedded.
    pub async fn create(pool: &PgPool, new_batch: NewBatch) -> Result<Batch, sqlx::Error> {
        let snapshot = serde_json::to_value(&new_batch.config_snapshot)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

        sqlx::query_as::<_, Batch>(&format!(
            r#"
            INSERT INTO eval_batches (name, folder_ids, config_snapshot, status,
                                      total_documents, processed_documents, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 0, 0, NOW(), NOW())
            RETURNING {BATCH_COLUMNS}
            "#
        ))
        .bind(&new_batch.name)
        .bind(&new_batch.folder_ids)
        .bind(snapshot)
        .bind(BatchStatus::Saved.to_string())
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<Batch>, sqlx::Error> {
        sqlx::query_as::<_, Batch>(&format!(
            "SELECT {BATCH_COLUMNS} FROM eval_batches WHERE batch_id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// Parse the embedded snapshot back into its value object.
    pub fn snapshot(&self) -> Option<ConfigSnapshot> {
        self.config_snapshot
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Parse the stored status string.
    pub fn batch_status(&self) -> Result<BatchStatus, String> {
        self.status.parse()
    }

    /// Write the config snapshot only if none exists yet. The snapshot is
    /// the reproducibility record for the run and is never regenerated;
    /// returns whether this call was the one that wrote it.
    pub async fn set_config_snapshot_if_absent(
        pool: &PgPool,
        batch_id: i64,
        snapshot: &ConfigSnapshot,
    ) -> Result<bool, sqlx::Error> {
        let value =
            serde_json::to_value(snapshot).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

        let result = sqlx::query(
            r#"
            UPDATE eval_batches
            SET config_snapshot = $2, updated_at = NOW()
            WHERE batch_id = $1 AND config_snapshot IS NULL
            "#,
        )
        .bind(batch_id)
        .bind(value)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Conditionally move the batch from one of `from` to `to`. Returns
    /// whether this writer won; a `false` means another writer got there
    /// first or the batch is not in an expected status.
    pub async fn transition_status(
        pool: &PgPool,
        batch_id: i64,
        from: &[BatchStatus],
        to: BatchStatus,
    ) -> Result<bool, sqlx::Error> {
        let from_strings: Vec<String> = from.iter().map(ToString::to_string).collect();
        let now = Utc::now().naive_utc();

        let result = sqlx::query(
            r#"
            UPDATE eval_batches
            SET status = $2,
                updated_at = NOW(),
                started_at = CASE WHEN $3 THEN COALESCE(started_at, $4) ELSE started_at END,
                completed_at = CASE WHEN $5 THEN $4 ELSE completed_at END
            WHERE batch_id = $1 AND status = ANY($6)
            "#,
        )
        .bind(batch_id)
        .bind(to.to_string())
        .bind(to == BatchStatus::Processing || to == BatchStatus::Analyzing)
        .bind(now)
        .bind(to.is_terminal())
        .bind(&from_strings)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_total_documents(
        pool: &PgPool,
        batch_id: i64,
        total: i32,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE eval_batches SET total_documents = $2, updated_at = NOW() WHERE batch_id = $1",
        )
        .bind(batch_id)
        .bind(total)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Refresh the processed-documents counter: documents whose every task
    /// has reached a terminal status.
    pub async fn refresh_processed_documents(
        pool: &PgPool,
        batch_id: i64,
    ) -> Result<i32, sqlx::Error> {
        let (processed,): (i32,) = sqlx::query_as(
            r#"
            WITH done AS (
                SELECT document_id
                FROM eval_tasks
                WHERE batch_id = $1
                GROUP BY document_id
                HAVING COUNT(*) FILTER (WHERE status NOT IN ('COMPLETED', 'FAILED')) = 0
            )
            UPDATE eval_batches
            SET processed_documents = (SELECT COUNT(*) FROM done)::INT, updated_at = NOW()
            WHERE batch_id = $1
            RETURNING processed_documents
            "#,
        )
        .bind(batch_id)
        .fetch_one(pool)
        .await?;

        Ok(processed)
    }

    /// Batches sitting in a transient status whose activity clock predates
    /// `cutoff`. STAGING batches have no `started_at` yet, so the clock
    /// falls back to `updated_at`.
    pub async fn list_stale_transient(
        pool: &PgPool,
        cutoff: NaiveDateTime,
    ) -> Result<Vec<Batch>, sqlx::Error> {
        let transient: Vec<String> = BatchStatus::transient()
            .iter()
            .map(ToString::to_string)
            .collect();

        sqlx::query_as::<_, Batch>(&format!(
            r#"
            SELECT {BATCH_COLUMNS}
            FROM eval_batches
            WHERE status = ANY($1)
              AND COALESCE(started_at, updated_at) < $2
            ORDER BY batch_id
            "#
        ))
        .bind(&transient)
        .bind(cutoff)
        .fetch_all(pool)
        .await
    }
}
