use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

/// A configured LLM provider endpoint.
///
/// Live rows are process-wide mutable configuration; running batches never
/// read them directly but through the immutable snapshot taken at batch
/// creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Connection {
    pub connection_id: i64,
    pub name: String,
    pub endpoint_url: String,
    pub model_id: String,
    pub provider_type: String,
    /// Reference into the credential store, never the secret itself
    pub api_key_ref: Option<String>,
    /// Provider-specific request fields
    pub extra: Option<serde_json::Value>,
    pub active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Connection {
    pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<Connection>, sqlx::Error> {
        sqlx::query_as::<_, Connection>(
            r#"
            SELECT connection_id, name, endpoint_url, model_id, provider_type,
                   api_key_ref, extra, active, created_at, updated_at
            FROM eval_connections
            WHERE connection_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn list_active(pool: &PgPool) -> Result<Vec<Connection>, sqlx::Error> {
        sqlx::query_as::<_, Connection>(
            r#"
            SELECT connection_id, name, endpoint_url, model_id, provider_type,
                   api_key_ref, extra, active, created_at, updated_at
            FROM eval_connections
            WHERE active = true
            ORDER BY connection_id
            "#,
        )
        .fetch_all(pool)
        .await
    }
}
