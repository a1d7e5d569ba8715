//! # External Evaluator Seam
//!
//! The engine does not talk to any LLM provider directly; it hands each
//! claimed task to an implementation of [`Evaluator`] carrying the
//! content-store key, the prompt text, and the snapshotted connection
//! configuration. The exact request/response schema behind the trait is
//! evaluator-specific and out of scope here.
//!
//! Unavailability is a first-class outcome: a dispatch that fails with
//! [`EvaluatorError::Unavailable`] leaves the task QUEUED for the next wave
//! rather than orphaning it.

use crate::models::{ConnectionSnapshot, TaskResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Everything the evaluator needs to issue one evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub task_id: i64,
    /// Content-store key of the encoded document payload
    pub content_key: String,
    pub prompt_text: String,
    /// Frozen connection configuration from the batch snapshot
    pub connection: ConnectionSnapshot,
}

/// What the evaluator hands back for a dispatched task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EvaluationResponse {
    /// The evaluation finished synchronously
    Completed(TaskResult),
    /// The evaluator accepted the work; poll or await a callback under this
    /// handle
    Accepted { task_handle: String },
    /// The evaluator processed the task and reports a per-task failure
    Failed { error_message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum EvaluatorError {
    /// The evaluator could not take the task at all; the task stays QUEUED
    #[error("evaluator unavailable: {0}")]
    Unavailable(String),

    #[error("evaluator rejected the request: {0}")]
    InvalidRequest(String),
}

/// The external LLM evaluation service boundary.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(
        &self,
        request: EvaluationRequest,
    ) -> Result<EvaluationResponse, EvaluatorError>;
}
