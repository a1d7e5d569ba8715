//! # Content Store
//!
//! Durable keyed storage of encoded document payloads and per-task result
//! detail, addressed by composite keys derived from the owning batch.
//!
//! ## Overview
//!
//! The store lives in its own failure domain: it gets its own pool and no
//! control-plane transaction ever spans it. Consistency with the control
//! plane comes from re-derivable keys and idempotent upserts rather than
//! distributed transactions.
//!
//! `put` enforces the codec's well-formedness invariant at write time so a
//! malformed record can never be persisted, let alone dispatched. Historical
//! malformed rows (written before that guard existed) are handled by
//! [`PgContentStore::repair_legacy_records`], an explicit startup migration.

use crate::content::codec::{CodecError, ContentCodec};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::PgPool;
use std::fmt;
use tracing::{debug, info, instrument, warn};

/// Composite key addressing a record in the content plane.
///
/// Keys render as stable strings so they can be re-derived from control-plane
/// identifiers alone, without a lookup table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContentKey {
    /// Encoded bytes of one document staged into one batch
    Document { batch_id: i64, document_id: i64 },
    /// Full evaluator response detail for one task
    TaskResult { batch_id: i64, task_id: i64 },
}

impl ContentKey {
    pub fn document(batch_id: i64, document_id: i64) -> Self {
        Self::Document {
            batch_id,
            document_id,
        }
    }

    pub fn task_result(batch_id: i64, task_id: i64) -> Self {
        Self::TaskResult { batch_id, task_id }
    }

    /// Prefix shared by every key belonging to a batch, used for purging.
    pub fn batch_prefix(batch_id: i64) -> String {
        format!("batch:{batch_id}:")
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Document {
                batch_id,
                document_id,
            } => write!(f, "batch:{batch_id}:doc:{document_id}"),
            Self::TaskResult { batch_id, task_id } => {
                write!(f, "batch:{batch_id}:result:{task_id}")
            }
        }
    }
}

/// Errors surfaced by content store operations.
#[derive(Debug, thiserror::Error)]
pub enum ContentStoreError {
    #[error("content record not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Malformed(#[from] CodecError),

    #[error("content store error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for ContentStoreError {
    fn from(e: sqlx::Error) -> Self {
        ContentStoreError::Storage(e.to_string())
    }
}

/// Keyed storage of encoded payloads.
///
/// `put` is an upsert and must reject payloads that fail the codec length
/// invariant; `get` fails with `NotFound` for absent keys.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn put(
        &self,
        key: &ContentKey,
        payload: &str,
        byte_length: i64,
    ) -> Result<(), ContentStoreError>;

    async fn get(&self, key: &ContentKey) -> Result<String, ContentStoreError>;

    /// Delete every record belonging to a batch. Returns the purged count.
    async fn delete_batch(&self, batch_id: i64) -> Result<u64, ContentStoreError>;
}

/// PostgreSQL-backed content store on its own pool.
#[derive(Debug, Clone)]
pub struct PgContentStore {
    pool: PgPool,
    codec: ContentCodec,
}

#[derive(sqlx::FromRow)]
struct ContentRow {
    encoded_payload: String,
}

#[derive(sqlx::FromRow)]
struct LegacyRow {
    content_key: String,
    encoded_payload: String,
}

/// Outcome of the startup scan over historical records.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LegacyRepairReport {
    pub scanned: u64,
    pub malformed: u64,
    pub repaired: u64,
    pub unrecoverable: u64,
}

impl PgContentStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            codec: ContentCodec::new(),
        }
    }

    /// Startup migration for records persisted before write-time validation
    /// existed. With `repair` false the scan only counts malformed rows;
    /// with `repair` true each repairable row is rewritten once via the
    /// codec's explicit padding remediation. Rows that cannot be repaired
    /// are deleted so they can be regenerated from source, never patched
    /// in place with guesswork.
    #[instrument(skip(self))]
    pub async fn repair_legacy_records(
        &self,
        repair: bool,
    ) -> Result<LegacyRepairReport, ContentStoreError> {
        let rows = sqlx::query_as::<_, LegacyRow>(
            "SELECT content_key, encoded_payload FROM document_contents",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut report = LegacyRepairReport {
            scanned: rows.len() as u64,
            ..Default::default()
        };

        for row in rows {
            if self.codec.validate(&row.encoded_payload).is_ok() {
                continue;
            }
            report.malformed += 1;

            if !repair {
                continue;
            }

            match self.codec.repair_padding(&row.content_key, &row.encoded_payload) {
                Ok(repaired) => {
                    sqlx::query(
                        "UPDATE document_contents SET encoded_payload = $2 WHERE content_key = $1",
                    )
                    .bind(&row.content_key)
                    .bind(&repaired)
                    .execute(&self.pool)
                    .await?;
                    report.repaired += 1;
                }
                Err(e) => {
                    warn!(
                        content_key = %row.content_key,
                        error = %e,
                        "Deleting unrecoverable legacy content record for regeneration"
                    );
                    sqlx::query("DELETE FROM document_contents WHERE content_key = $1")
                        .bind(&row.content_key)
                        .execute(&self.pool)
                        .await?;
                    report.unrecoverable += 1;
                }
            }
        }

        if report.malformed > 0 {
            warn!(
                scanned = report.scanned,
                malformed = report.malformed,
                repaired = report.repaired,
                unrecoverable = report.unrecoverable,
                repair_enabled = repair,
                "Legacy content scan found malformed records"
            );
        } else {
            info!(scanned = report.scanned, "Legacy content scan clean");
        }

        Ok(report)
    }
}

#[async_trait]
impl ContentStore for PgContentStore {
    #[instrument(skip(self, payload), fields(key = %key))]
    async fn put(
        &self,
        key: &ContentKey,
        payload: &str,
        byte_length: i64,
    ) -> Result<(), ContentStoreError> {
        // Fail fast at write time: a malformed record must never persist
        self.codec.validate(payload)?;

        sqlx::query(
            r#"
            INSERT INTO document_contents (content_key, encoded_payload, byte_length, created_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (content_key)
            DO UPDATE SET encoded_payload = EXCLUDED.encoded_payload,
                          byte_length = EXCLUDED.byte_length
            "#,
        )
        .bind(key.to_string())
        .bind(payload)
        .bind(byte_length)
        .execute(&self.pool)
        .await?;

        debug!(key = %key, byte_length, "Stored encoded content");
        Ok(())
    }

    async fn get(&self, key: &ContentKey) -> Result<String, ContentStoreError> {
        let row = sqlx::query_as::<_, ContentRow>(
            "SELECT encoded_payload FROM document_contents WHERE content_key = $1",
        )
        .bind(key.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.encoded_payload),
            None => Err(ContentStoreError::NotFound(key.to_string())),
        }
    }

    #[instrument(skip(self))]
    async fn delete_batch(&self, batch_id: i64) -> Result<u64, ContentStoreError> {
        let result = sqlx::query("DELETE FROM document_contents WHERE content_key LIKE $1")
            .bind(format!("{}%", ContentKey::batch_prefix(batch_id)))
            .execute(&self.pool)
            .await?;

        debug!(batch_id, purged = result.rows_affected(), "Purged batch content");
        Ok(result.rows_affected())
    }
}

/// In-memory content store used by tests and local tooling.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    records: DashMap<String, (String, i64, DateTime<Utc>)>,
    codec: ContentCodec,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(
        &self,
        key: &ContentKey,
        payload: &str,
        byte_length: i64,
    ) -> Result<(), ContentStoreError> {
        self.codec.validate(payload)?;
        self.records
            .insert(key.to_string(), (payload.to_string(), byte_length, Utc::now()));
        Ok(())
    }

    async fn get(&self, key: &ContentKey) -> Result<String, ContentStoreError> {
        self.records
            .get(&key.to_string())
            .map(|entry| entry.value().0.clone())
            .ok_or_else(|| ContentStoreError::NotFound(key.to_string()))
    }

    async fn delete_batch(&self, batch_id: i64) -> Result<u64, ContentStoreError> {
        let prefix = ContentKey::batch_prefix(batch_id);
        let before = self.records.len();
        self.records.retain(|key, _| !key.starts_with(&prefix));
        Ok((before - self.records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_key_rendering() {
        assert_eq!(ContentKey::document(7, 42).to_string(), "batch:7:doc:42");
        assert_eq!(
            ContentKey::task_result(7, 99).to_string(),
            "batch:7:result:99"
        );
        assert_eq!(ContentKey::batch_prefix(7), "batch:7:");
    }

    #[tokio::test]
    async fn test_memory_store_rejects_malformed_payload() {
        let store = MemoryContentStore::new();
        let key = ContentKey::document(1, 1);
        let err = store.put(&key, "QUJ", 3).await.unwrap_err();
        assert!(matches!(err, ContentStoreError::Malformed(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_put_get_round_trip() {
        let store = MemoryContentStore::new();
        let codec = ContentCodec::new();
        let key = ContentKey::document(1, 2);
        let payload = codec.encode(b"hello world");

        store.put(&key, &payload, 11).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_memory_store_get_missing_is_not_found() {
        let store = MemoryContentStore::new();
        let err = store.get(&ContentKey::document(9, 9)).await.unwrap_err();
        assert!(matches!(err, ContentStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_memory_store_put_is_upsert() {
        let store = MemoryContentStore::new();
        let codec = ContentCodec::new();
        let key = ContentKey::document(1, 2);

        store.put(&key, &codec.encode(b"v1"), 2).await.unwrap();
        store.put(&key, &codec.encode(b"v2"), 2).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&key).await.unwrap(), codec.encode(b"v2"));
    }

    #[tokio::test]
    async fn test_memory_store_batch_prefix_delete() {
        let store = MemoryContentStore::new();
        let codec = ContentCodec::new();
        let payload = codec.encode(b"x");

        store.put(&ContentKey::document(1, 1), &payload, 1).await.unwrap();
        store.put(&ContentKey::document(1, 2), &payload, 1).await.unwrap();
        store.put(&ContentKey::task_result(1, 5), &payload, 1).await.unwrap();
        store.put(&ContentKey::document(2, 1), &payload, 1).await.unwrap();

        let purged = store.delete_batch(1).await.unwrap();
        assert_eq!(purged, 3);
        assert_eq!(store.len(), 1);
        assert!(store.get(&ContentKey::document(2, 1)).await.is_ok());
    }
}
