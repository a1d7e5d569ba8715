#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Doceval Core
//!
//! Batch lifecycle state machine and task dispatch/recovery engine for bulk
//! evaluation of document collections against multiple LLM connections and
//! prompts.
//!
//! ## Overview
//!
//! A caller asks for a batch ("evaluate these folders against these
//! connections and prompts"). The engine snapshots the live connection/prompt
//! configuration into the batch record, expands documents × connections ×
//! prompts into a durable task set, dispatches tasks to an external evaluator
//! in bounded waves, tracks per-task progress, and aggregates the terminal
//! batch status. A recovery sweeper runs independently to repair work left
//! stuck by crashed workers.
//!
//! The engine spans two independently-failing stores: a control-plane
//! PostgreSQL database (batches, documents, tasks, connections, prompts) and
//! a content-plane store (encoded document bytes and per-task result detail).
//! The two are never coupled by a transaction; every operation is idempotent
//! and keyed by re-derivable composite identifiers instead.
//!
//! ## Module Organization
//!
//! - [`models`] - Batch, document, task, connection, prompt, config snapshot
//! - [`content`] - Transport codec and keyed content store
//! - [`state_machine`] - Batch status transitions
//! - [`orchestration`] - Lifecycle driver, dispatcher, recovery sweeper
//! - [`registry`] - Process-wide mutable connection/prompt configuration
//! - [`config`] - Engine configuration
//! - [`error`] - Structured error handling
//!
//! ## Concurrency Model
//!
//! Multiple dispatcher workers and the sweeper run concurrently against the
//! same database with no in-process mutual exclusion. Correctness rests on
//! atomic conditional updates: claiming is a single
//! `UPDATE ... FOR UPDATE SKIP LOCKED ... RETURNING` statement, so no two
//! workers ever observe the same task as claimable.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use doceval_core::config::EngineConfig;
//! use doceval_core::orchestration::bootstrap::Engine;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = EngineConfig::from_env()?;
//! let engine = Engine::boot(config).await?;
//! let batch = engine.lifecycle().create_batch("nightly run", &[1, 2]).await?;
//! engine.lifecycle().stage_batch(batch.batch_id).await?;
//! engine.lifecycle().run_batch(batch.batch_id).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod content;
pub mod database;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod registry;
pub mod state_machine;

pub use config::EngineConfig;
pub use content::codec::{CodecError, ContentCodec};
pub use content::store::{
    ContentKey, ContentStore, ContentStoreError, MemoryContentStore, PgContentStore,
};
pub use error::{EvalError, Result};
pub use models::{Batch, ConfigSnapshot, Connection, Document, EvalTask, Prompt};
pub use state_machine::{BatchEvent, BatchStatus, TaskStatus};
