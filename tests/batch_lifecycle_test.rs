//! Batch Lifecycle Integration Tests
//!
//! Full staging/dispatch/finalization flow with a scripted evaluator, an
//! in-memory content store, and documents on a temp filesystem. Ignored by
//! default; run with `cargo test -- --ignored` and a live DATABASE_URL.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use doceval_core::config::EngineConfig;
use doceval_core::content::store::{ContentKey, ContentStore, MemoryContentStore};
use doceval_core::models::{Batch, Connection, EvalTask, Prompt, TaskResult};
use doceval_core::orchestration::dispatcher::TaskDispatcher;
use doceval_core::orchestration::evaluator::{
    EvaluationRequest, EvaluationResponse, Evaluator, EvaluatorError,
};
use doceval_core::orchestration::lifecycle::{BatchLifecycle, FsDocumentSource};
use doceval_core::registry::ConfigRegistry;
use doceval_core::state_machine::BatchStatus;
use sqlx::PgPool;

/// Evaluator scripted per test: completes, fails every Nth task, or reports
/// itself unavailable.
struct ScriptedEvaluator {
    fail_every: Option<usize>,
    unavailable: bool,
    calls: AtomicUsize,
}

impl ScriptedEvaluator {
    fn completing() -> Self {
        Self {
            fail_every: None,
            unavailable: false,
            calls: AtomicUsize::new(0),
        }
    }

    fn failing_every(n: usize) -> Self {
        Self {
            fail_every: Some(n),
            unavailable: false,
            calls: AtomicUsize::new(0),
        }
    }

    fn unavailable() -> Self {
        Self {
            fail_every: None,
            unavailable: true,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn evaluate(
        &self,
        _request: EvaluationRequest,
    ) -> Result<EvaluationResponse, EvaluatorError> {
        if self.unavailable {
            return Err(EvaluatorError::Unavailable("connection refused".to_string()));
        }

        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(n) = self.fail_every {
            if call % n == 0 {
                return Ok(EvaluationResponse::Failed {
                    error_message: format!("scripted failure on call {call}"),
                });
            }
        }

        Ok(EvaluationResponse::Completed(TaskResult {
            score: Some(0.8),
            result_text: Some("looks good".to_string()),
            duration_ms: Some(42),
            prompt_tokens: Some(100),
            completion_tokens: Some(20),
        }))
    }
}

struct Harness {
    lifecycle: BatchLifecycle,
    content_store: Arc<MemoryContentStore>,
    _docs_dir: tempfile::TempDir,
}

async fn harness(pool: &PgPool, evaluator: Arc<dyn Evaluator>) -> Harness {
    let docs_dir = tempfile::tempdir().unwrap();

    // Two ingested documents in folder 1
    for name in ["a.txt", "b.txt"] {
        let path = docs_dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(format!("contents of {name}").as_bytes()).unwrap();
        sqlx::query(
            "INSERT INTO eval_documents (folder_id, filepath, byte_size) VALUES (1, $1, 10)",
        )
        .bind(path.to_string_lossy().to_string())
        .execute(pool)
        .await
        .unwrap();
    }

    let registry = Arc::new(ConfigRegistry::new());
    let now = Utc::now().naive_utc();
    registry.replace_connections(
        (1..=2)
            .map(|id| Connection {
                connection_id: id,
                name: format!("conn-{id}"),
                endpoint_url: "https://api.example.com/v1".to_string(),
                model_id: "gpt-4o".to_string(),
                provider_type: "openai".to_string(),
                api_key_ref: None,
                extra: None,
                active: true,
                created_at: now,
                updated_at: now,
            })
            .collect(),
    );
    registry.replace_prompts(
        (1..=3)
            .map(|id| Prompt {
                prompt_id: id,
                name: format!("prompt-{id}"),
                prompt_text: "Assess the document.".to_string(),
                active: true,
                created_at: now,
                updated_at: now,
            })
            .collect(),
    );

    let content_store = Arc::new(MemoryContentStore::new());
    let dispatcher = Arc::new(TaskDispatcher::new(
        pool.clone(),
        evaluator,
        content_store.clone(),
    ));
    let lifecycle = BatchLifecycle::new(
        pool.clone(),
        content_store.clone(),
        registry,
        Arc::new(FsDocumentSource),
        dispatcher,
        EngineConfig::default(),
    );

    Harness {
        lifecycle,
        content_store,
        _docs_dir: docs_dir,
    }
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL instance"]
async fn test_staging_builds_full_cross_product(pool: PgPool) -> sqlx::Result<()> {
    let h = harness(&pool, Arc::new(ScriptedEvaluator::completing())).await;

    let batch = h.lifecycle.create_batch("cross product", &[1]).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Saved.to_string());

    let staged = h.lifecycle.stage_batch(batch.batch_id).await.unwrap();
    assert_eq!(staged.status, BatchStatus::Staged.to_string());
    assert_eq!(staged.total_documents, 2);

    // 2 documents x 2 connections x 3 prompts = 12 tasks, all QUEUED
    let counts = EvalTask::status_counts(&pool, batch.batch_id).await.unwrap();
    assert_eq!(counts.queued, 12);
    assert_eq!(counts.total(), 12);

    // Encoded content persisted for both documents
    assert!(h
        .content_store
        .get(&ContentKey::document(batch.batch_id, 1))
        .await
        .is_ok());
    Ok(())
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL instance"]
async fn test_run_completes_batch_when_all_tasks_succeed(pool: PgPool) -> sqlx::Result<()> {
    let h = harness(&pool, Arc::new(ScriptedEvaluator::completing())).await;

    let batch = h.lifecycle.create_batch("happy path", &[1]).await.unwrap();
    h.lifecycle.stage_batch(batch.batch_id).await.unwrap();
    h.lifecycle.run_batch(batch.batch_id).await.unwrap();

    let finished = Batch::find_by_id(&pool, batch.batch_id).await?.unwrap();
    assert_eq!(finished.status, BatchStatus::Completed.to_string());
    assert_eq!(finished.processed_documents, 2);
    assert!(finished.completed_at.is_some());

    let counts = EvalTask::status_counts(&pool, batch.batch_id).await.unwrap();
    assert_eq!(counts.completed, 12);

    // Content plane holds the two encoded documents plus result detail for
    // each completed task
    assert_eq!(h.content_store.len(), 14);
    Ok(())
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL instance"]
async fn test_any_failed_task_fails_the_batch(pool: PgPool) -> sqlx::Result<()> {
    // Every 12th call fails: exactly one task out of twelve
    let h = harness(&pool, Arc::new(ScriptedEvaluator::failing_every(12))).await;

    let batch = h.lifecycle.create_batch("one bad apple", &[1]).await.unwrap();
    h.lifecycle.stage_batch(batch.batch_id).await.unwrap();
    h.lifecycle.run_batch(batch.batch_id).await.unwrap();

    let finished = Batch::find_by_id(&pool, batch.batch_id).await?.unwrap();
    assert_eq!(finished.status, BatchStatus::Failed.to_string());

    // Failure reported at batch granularity with per-task messages
    let report = h.lifecycle.failure_report(batch.batch_id).await.unwrap();
    assert_eq!(report.failed_tasks, 1);
    assert!(report.errors[0].error_message.contains("scripted failure"));
    Ok(())
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL instance"]
async fn test_evaluator_outage_leaves_tasks_queued(pool: PgPool) -> sqlx::Result<()> {
    let h = harness(&pool, Arc::new(ScriptedEvaluator::unavailable())).await;

    let batch = h.lifecycle.create_batch("outage", &[1]).await.unwrap();
    h.lifecycle.stage_batch(batch.batch_id).await.unwrap();
    h.lifecycle.run_batch(batch.batch_id).await.unwrap();

    // Nothing was dispatched: the batch never advanced and every task is
    // back in QUEUED for the next wave
    let batch_row = Batch::find_by_id(&pool, batch.batch_id).await?.unwrap();
    assert_eq!(batch_row.status, BatchStatus::Staged.to_string());

    let counts = EvalTask::status_counts(&pool, batch.batch_id).await.unwrap();
    assert_eq!(counts.queued, 12);
    assert_eq!(counts.processing, 0);
    Ok(())
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL instance"]
async fn test_rerun_on_processing_batch_is_safe(pool: PgPool) -> sqlx::Result<()> {
    let h = harness(&pool, Arc::new(ScriptedEvaluator::completing())).await;

    let batch = h.lifecycle.create_batch("re-entry", &[1]).await.unwrap();
    h.lifecycle.stage_batch(batch.batch_id).await.unwrap();
    h.lifecycle.run_batch(batch.batch_id).await.unwrap();

    // A second run on a finished batch finds nothing to claim and changes
    // nothing
    let before = Batch::find_by_id(&pool, batch.batch_id).await?.unwrap();
    assert!(h.lifecycle.run_batch(batch.batch_id).await.is_err() || {
        let after = Batch::find_by_id(&pool, batch.batch_id).await.unwrap().unwrap();
        after.status == before.status
    });
    Ok(())
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL instance"]
async fn test_cancel_fails_remaining_queued_tasks(pool: PgPool) -> sqlx::Result<()> {
    let h = harness(&pool, Arc::new(ScriptedEvaluator::completing())).await;

    let batch = h.lifecycle.create_batch("cancelled", &[1]).await.unwrap();
    h.lifecycle.stage_batch(batch.batch_id).await.unwrap();

    let cancelled = h.lifecycle.cancel_batch(batch.batch_id).await.unwrap();
    assert_eq!(cancelled, 12);

    let counts = EvalTask::status_counts(&pool, batch.batch_id).await.unwrap();
    assert_eq!(counts.failed, 12);

    let batch_row = Batch::find_by_id(&pool, batch.batch_id).await?.unwrap();
    assert_eq!(batch_row.status, BatchStatus::Failed.to_string());
    Ok(())
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL instance"]
async fn test_cancel_terminates_batch_with_retryable_tasks(pool: PgPool) -> sqlx::Result<()> {
    let h = harness(&pool, Arc::new(ScriptedEvaluator::completing())).await;

    let batch = h.lifecycle.create_batch("cancelled retry", &[1]).await.unwrap();
    h.lifecycle.stage_batch(batch.batch_id).await.unwrap();

    // A previous run left part of the batch awaiting an operator retry
    sqlx::query(
        r#"
        UPDATE eval_tasks SET status = 'READY_TO_RETRY'
        WHERE task_id IN (
            SELECT task_id FROM eval_tasks WHERE batch_id = $1 ORDER BY task_id LIMIT 3
        )
        "#,
    )
    .bind(batch.batch_id)
    .execute(&pool)
    .await?;

    // Cancellation covers the retryable tasks too, not only QUEUED ones
    let cancelled = h.lifecycle.cancel_batch(batch.batch_id).await.unwrap();
    assert_eq!(cancelled, 12);

    let counts = EvalTask::status_counts(&pool, batch.batch_id).await.unwrap();
    assert_eq!(counts.failed, 12);
    assert_eq!(counts.ready_to_retry, 0);

    // Nothing non-terminal remains, so the batch reaches FAILED
    let batch_row = Batch::find_by_id(&pool, batch.batch_id).await?.unwrap();
    assert_eq!(batch_row.status, BatchStatus::Failed.to_string());
    Ok(())
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL instance"]
async fn test_staging_rolls_back_on_unreadable_document(pool: PgPool) -> sqlx::Result<()> {
    let h = harness(&pool, Arc::new(ScriptedEvaluator::completing())).await;

    // Break one ingested filepath so the document source fails mid-staging
    sqlx::query("UPDATE eval_documents SET filepath = '/nonexistent/missing.txt' WHERE folder_id = 1 AND filepath LIKE '%b.txt'")
        .execute(&pool)
        .await?;

    let batch = h.lifecycle.create_batch("rollback", &[1]).await.unwrap();
    assert!(h.lifecycle.stage_batch(batch.batch_id).await.is_err());

    // No half-STAGED state: batch back to SAVED, no tasks, no owned docs
    let batch_row = Batch::find_by_id(&pool, batch.batch_id).await?.unwrap();
    assert_eq!(batch_row.status, BatchStatus::Saved.to_string());
    assert_eq!(
        EvalTask::status_counts(&pool, batch.batch_id).await.unwrap().total(),
        0
    );
    let (owned,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM eval_documents WHERE batch_id = $1")
            .bind(batch.batch_id)
            .fetch_one(&pool)
            .await?;
    assert_eq!(owned, 0);
    Ok(())
}
