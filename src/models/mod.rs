//! Control-plane data layer: sqlx models over the batch, document, task,
//! connection and prompt tables, plus the config snapshot value object.

pub mod batch;
pub mod config_snapshot;
pub mod connection;
pub mod document;
pub mod prompt;
pub mod task;

pub use batch::{Batch, NewBatch};
pub use config_snapshot::{ConfigSnapshot, ConnectionSnapshot, PromptSnapshot};
pub use connection::Connection;
pub use document::Document;
pub use prompt::Prompt;
pub use task::{EvalTask, TaskResult, TaskStatusCounts};
