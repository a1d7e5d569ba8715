//! # Config Registry
//!
//! The process-wide mutable lists of connections and prompts. Callers edit
//! these freely at runtime; batches never hold a live reference to them.
//! At batch creation the lifecycle takes a [`ConfigSnapshot`] copy, which is
//! what decouples a running batch from later edits.

use crate::models::{ConfigSnapshot, Connection, Prompt};
use parking_lot::RwLock;
use sqlx::PgPool;

/// Shared, mutable view of the active connections and prompts.
#[derive(Debug, Default)]
pub struct ConfigRegistry {
    connections: RwLock<Vec<Connection>>,
    prompts: RwLock<Vec<Prompt>>,
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the active rows from the control-plane store.
    pub async fn refresh(&self, pool: &PgPool) -> Result<(), sqlx::Error> {
        let connections = Connection::list_active(pool).await?;
        let prompts = Prompt::list_active(pool).await?;

        *self.connections.write() = connections;
        *self.prompts.write() = prompts;
        Ok(())
    }

    pub fn replace_connections(&self, connections: Vec<Connection>) {
        *self.connections.write() = connections;
    }

    pub fn replace_prompts(&self, prompts: Vec<Prompt>) {
        *self.prompts.write() = prompts;
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.read().len()
    }

    /// Copy-on-use: freeze the current configuration into a value object.
    pub fn snapshot(&self) -> ConfigSnapshot {
        let connections = self.connections.read();
        let prompts = self.prompts.read();
        ConfigSnapshot::capture(&connections, &prompts)
    }
}
