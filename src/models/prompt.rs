use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

/// An evaluation prompt. Like connections, live rows are mutable
/// configuration that batches only ever see through their snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Prompt {
    pub prompt_id: i64,
    pub name: String,
    pub prompt_text: String,
    pub active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Prompt {
    pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<Prompt>, sqlx::Error> {
        sqlx::query_as::<_, Prompt>(
            r#"
            SELECT prompt_id, name, prompt_text, active, created_at, updated_at
            FROM eval_prompts
            WHERE prompt_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn list_active(pool: &PgPool) -> Result<Vec<Prompt>, sqlx::Error> {
        sqlx::query_as::<_, Prompt>(
            r#"
            SELECT prompt_id, name, prompt_text, active, created_at, updated_at
            FROM eval_prompts
            WHERE active = true
            ORDER BY prompt_id
            "#,
        )
        .fetch_all(pool)
        .await
    }
}
