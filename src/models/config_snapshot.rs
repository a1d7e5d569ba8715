//! # Config Snapshot
//!
//! Immutable copy of the connection/prompt configuration a batch runs
//! against, captured exactly once at batch creation and embedded in the
//! batch row as JSONB.
//!
//! Connections and prompts are process-wide mutable lookups; editing or
//! deleting one must never change what an in-flight batch does. The snapshot
//! is therefore a plain value object, never a live reference, and carries
//! everything needed to re-issue the exact request shape later.

use crate::models::{Connection, Prompt};
use serde::{Deserialize, Serialize};

/// Frozen copy of one connection, sufficient to rebuild its request shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub connection_id: i64,
    pub name: String,
    pub endpoint_url: String,
    pub model_id: String,
    pub provider_type: String,
    pub api_key_ref: Option<String>,
    pub extra: Option<serde_json::Value>,
}

impl From<&Connection> for ConnectionSnapshot {
    fn from(c: &Connection) -> Self {
        Self {
            connection_id: c.connection_id,
            name: c.name.clone(),
            endpoint_url: c.endpoint_url.clone(),
            model_id: c.model_id.clone(),
            provider_type: c.provider_type.clone(),
            api_key_ref: c.api_key_ref.clone(),
            extra: c.extra.clone(),
        }
    }
}

/// Frozen copy of one prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptSnapshot {
    pub prompt_id: i64,
    pub name: String,
    pub prompt_text: String,
}

impl From<&Prompt> for PromptSnapshot {
    fn from(p: &Prompt) -> Self {
        Self {
            prompt_id: p.prompt_id,
            name: p.name.clone(),
            prompt_text: p.prompt_text.clone(),
        }
    }
}

/// The reproducibility record for a batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConfigSnapshot {
    pub connections: Vec<ConnectionSnapshot>,
    pub prompts: Vec<PromptSnapshot>,
}

impl ConfigSnapshot {
    /// Capture the currently active configuration into a frozen copy.
    pub fn capture(connections: &[Connection], prompts: &[Prompt]) -> Self {
        Self {
            connections: connections.iter().map(ConnectionSnapshot::from).collect(),
            prompts: prompts.iter().map(PromptSnapshot::from).collect(),
        }
    }

    pub fn connection(&self, connection_id: i64) -> Option<&ConnectionSnapshot> {
        self.connections
            .iter()
            .find(|c| c.connection_id == connection_id)
    }

    pub fn prompt(&self, prompt_id: i64) -> Option<&PromptSnapshot> {
        self.prompts.iter().find(|p| p.prompt_id == prompt_id)
    }

    pub fn connection_ids(&self) -> Vec<i64> {
        self.connections.iter().map(|c| c.connection_id).collect()
    }

    pub fn prompt_ids(&self) -> Vec<i64> {
        self.prompts.iter().map(|p| p.prompt_id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty() || self.prompts.is_empty()
    }
}
