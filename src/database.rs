//! # Database Connections
//!
//! Pool construction for the two stores. The control plane and content plane
//! are separate failure domains: each gets its own pool and no operation ever
//! spans both in one transaction.

use crate::config::EngineConfig;
use crate::error::{EvalError, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Connected pools for both stores.
#[derive(Debug, Clone)]
pub struct StorePools {
    /// Batches, documents, tasks, connections, prompts
    pub control: PgPool,
    /// Encoded document bytes and task result detail
    pub content: PgPool,
}

impl StorePools {
    /// Connect to both stores. When the configured URLs match, the content
    /// pool is still created independently so the failure domains stay
    /// separate at the connection level.
    pub async fn connect(config: &EngineConfig) -> Result<Self> {
        let control = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .map_err(|e| {
                EvalError::DatabaseError(format!("control-plane connect failed: {e}"))
            })?;

        let content = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.content_database_url)
            .await
            .map_err(|e| {
                EvalError::DatabaseError(format!("content-plane connect failed: {e}"))
            })?;

        info!("Connected control-plane and content-plane pools");
        Ok(Self { control, content })
    }

    /// Run embedded migrations against both stores.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.control)
            .await
            .map_err(|e| EvalError::DatabaseError(format!("control-plane migrate failed: {e}")))?;

        // Content migrations are a subset; running the full set against a
        // shared database is a no-op for already-applied versions.
        sqlx::migrate!("./migrations")
            .run(&self.content)
            .await
            .map_err(|e| EvalError::DatabaseError(format!("content-plane migrate failed: {e}")))?;

        Ok(())
    }
}
