use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

/// A document ingested from a source folder.
///
/// Rows are created by the folder ingestion collaborator; this crate only
/// reads them and sets or clears `batch_id`. Assignment is exclusive: a
/// document belongs to at most one in-flight batch, enforced by the
/// conditional update in [`Document::assign_to_batch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Document {
    pub document_id: i64,
    pub folder_id: i64,
    pub filepath: String,
    pub byte_size: i64,
    pub content_type: Option<String>,
    pub batch_id: Option<i64>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Document {
    pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<Document>, sqlx::Error> {
        sqlx::query_as::<_, Document>(
            r#"
            SELECT document_id, folder_id, filepath, byte_size, content_type,
                   batch_id, created_at, updated_at
            FROM eval_documents
            WHERE document_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// Documents in the given folders that are not already owned by a batch.
    pub async fn list_unassigned_in_folders(
        pool: &PgPool,
        folder_ids: &[i64],
    ) -> Result<Vec<Document>, sqlx::Error> {
        sqlx::query_as::<_, Document>(
            r#"
            SELECT document_id, folder_id, filepath, byte_size, content_type,
                   batch_id, created_at, updated_at
            FROM eval_documents
            WHERE folder_id = ANY($1) AND batch_id IS NULL
            ORDER BY document_id
            "#,
        )
        .bind(folder_ids)
        .fetch_all(pool)
        .await
    }

    /// Documents currently owned by a batch.
    pub async fn list_for_batch(pool: &PgPool, batch_id: i64) -> Result<Vec<Document>, sqlx::Error> {
        sqlx::query_as::<_, Document>(
            r#"
            SELECT document_id, folder_id, filepath, byte_size, content_type,
                   batch_id, created_at, updated_at
            FROM eval_documents
            WHERE batch_id = $1
            ORDER BY document_id
            "#,
        )
        .bind(batch_id)
        .fetch_all(pool)
        .await
    }

    /// Claim the given documents for a batch. The `batch_id IS NULL` guard
    /// makes assignment exclusive under concurrency; returns the ids actually
    /// claimed, which may be fewer than requested.
    pub async fn assign_to_batch(
        pool: &PgPool,
        batch_id: i64,
        document_ids: &[i64],
    ) -> Result<Vec<i64>, sqlx::Error> {
        let rows = sqlx::query_as::<_, (i64,)>(
            r#"
            UPDATE eval_documents
            SET batch_id = $1, updated_at = NOW()
            WHERE document_id = ANY($2)
              AND (batch_id IS NULL OR batch_id = $1)
            RETURNING document_id
            "#,
        )
        .bind(batch_id)
        .bind(document_ids)
        .fetch_all(pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Release every document owned by a batch (staging rollback or discard).
    pub async fn release_for_batch(pool: &PgPool, batch_id: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE eval_documents
            SET batch_id = NULL, updated_at = NOW()
            WHERE batch_id = $1
            "#,
        )
        .bind(batch_id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }
}
