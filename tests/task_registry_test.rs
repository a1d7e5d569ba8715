//! Task Registry Integration Tests
//!
//! Exercises staging idempotency, atomic claiming, idempotent terminal
//! transitions, and the dedupe maintenance operation against a real
//! PostgreSQL instance. These run under `#[sqlx::test]` with the embedded
//! migrations; they are ignored by default so the suite passes on machines
//! without a database (run with `cargo test -- --ignored` against a live
//! DATABASE_URL).

use doceval_core::models::{Batch, ConfigSnapshot, EvalTask, NewBatch, TaskResult};
use doceval_core::state_machine::TaskStatus;
use sqlx::PgPool;

async fn seed_batch(pool: &PgPool) -> i64 {
    let batch = Batch::create(
        pool,
        NewBatch {
            name: "test batch".to_string(),
            folder_ids: vec![1],
            config_snapshot: ConfigSnapshot::default(),
        },
    )
    .await
    .unwrap();
    batch.batch_id
}

async fn seed_documents(pool: &PgPool, batch_id: i64, count: i64) -> Vec<i64> {
    let mut ids = Vec::new();
    for i in 0..count {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO eval_documents (folder_id, filepath, byte_size, batch_id)
            VALUES (1, $1, 10, $2)
            RETURNING document_id
            "#,
        )
        .bind(format!("/docs/file-{i}.txt"))
        .bind(batch_id)
        .fetch_one(pool)
        .await
        .unwrap();
        ids.push(id);
    }
    ids
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL instance"]
async fn test_staging_is_idempotent(pool: PgPool) -> sqlx::Result<()> {
    let batch_id = seed_batch(&pool).await;
    let docs = seed_documents(&pool, batch_id, 1).await;

    // 1 document x 3 prompts x 2 connections = 6 tasks
    let created = EvalTask::stage(&pool, batch_id, &docs, &[10, 11, 12], &[20, 21])
        .await
        .unwrap();
    assert_eq!(created, 6);

    let counts = EvalTask::status_counts(&pool, batch_id).await.unwrap();
    assert_eq!(counts.queued, 6);
    assert_eq!(counts.total(), 6);

    // Staging again creates nothing new
    let created_again = EvalTask::stage(&pool, batch_id, &docs, &[10, 11, 12], &[20, 21])
        .await
        .unwrap();
    assert_eq!(created_again, 0);
    assert_eq!(
        EvalTask::status_counts(&pool, batch_id).await.unwrap().total(),
        6
    );

    Ok(())
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL instance"]
async fn test_concurrent_claims_never_overlap(pool: PgPool) -> sqlx::Result<()> {
    let batch_id = seed_batch(&pool).await;
    let docs = seed_documents(&pool, batch_id, 10).await;
    EvalTask::stage(&pool, batch_id, &docs, &[1], &[1]).await.unwrap();

    let (a, b) = tokio::join!(
        EvalTask::claim_next(&pool, batch_id, 7),
        EvalTask::claim_next(&pool, batch_id, 7),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    // Ten tasks total: the two claimers split them with no overlap
    assert_eq!(a.len() + b.len(), 10);
    for task in &a {
        assert!(!b.iter().any(|t| t.task_id == task.task_id));
        assert_eq!(task.status, TaskStatus::Processing.to_string());
        assert!(task.started_processing_at.is_some());
    }

    // Nothing left to claim
    assert!(EvalTask::claim_next(&pool, batch_id, 10).await.unwrap().is_empty());
    Ok(())
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL instance"]
async fn test_complete_and_fail_are_idempotent(pool: PgPool) -> sqlx::Result<()> {
    let batch_id = seed_batch(&pool).await;
    let docs = seed_documents(&pool, batch_id, 2).await;
    EvalTask::stage(&pool, batch_id, &docs, &[1], &[1]).await.unwrap();

    let claimed = EvalTask::claim_next(&pool, batch_id, 2).await.unwrap();
    let (first, second) = (claimed[0].task_id, claimed[1].task_id);

    let result = TaskResult {
        score: Some(0.9),
        result_text: Some("fine".to_string()),
        ..Default::default()
    };
    assert!(EvalTask::complete(&pool, first, &result).await.unwrap());
    // Second completion is a no-op, not an error
    assert!(!EvalTask::complete(&pool, first, &result).await.unwrap());

    assert!(EvalTask::fail(&pool, second, "provider 500").await.unwrap());
    assert!(!EvalTask::fail(&pool, second, "duplicate report").await.unwrap());

    // The first error message wins
    let task = EvalTask::find_by_id(&pool, second).await.unwrap().unwrap();
    assert_eq!(task.error_message.as_deref(), Some("provider 500"));

    let counts = EvalTask::status_counts(&pool, batch_id).await.unwrap();
    assert!(counts.all_terminal());
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.failed, 1);
    Ok(())
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL instance"]
async fn test_dedupe_keeps_lowest_task_id(pool: PgPool) -> sqlx::Result<()> {
    let batch_id = seed_batch(&pool).await;
    let docs = seed_documents(&pool, batch_id, 1).await;

    // Simulate historical duplicates by dropping the constraint first
    sqlx::query("ALTER TABLE eval_tasks DROP CONSTRAINT uq_eval_tasks_tuple")
        .execute(&pool)
        .await?;

    let mut ids = Vec::new();
    for _ in 0..3 {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO eval_tasks (batch_id, document_id, prompt_id, connection_id, status)
            VALUES ($1, $2, 1, 1, 'QUEUED')
            RETURNING task_id
            "#,
        )
        .bind(batch_id)
        .bind(docs[0])
        .fetch_one(&pool)
        .await?;
        ids.push(id);
    }

    let deleted = EvalTask::dedupe(&pool, batch_id).await.unwrap();
    assert_eq!(deleted, 2);

    let counts = EvalTask::status_counts(&pool, batch_id).await.unwrap();
    assert_eq!(counts.total(), 1);

    let survivor = EvalTask::find_by_id(&pool, *ids.iter().min().unwrap())
        .await
        .unwrap();
    assert!(survivor.is_some(), "the lowest task_id survives");
    Ok(())
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL instance"]
async fn test_release_claim_returns_task_to_queue(pool: PgPool) -> sqlx::Result<()> {
    let batch_id = seed_batch(&pool).await;
    let docs = seed_documents(&pool, batch_id, 1).await;
    EvalTask::stage(&pool, batch_id, &docs, &[1], &[1]).await.unwrap();

    let claimed = EvalTask::claim_next(&pool, batch_id, 1).await.unwrap();
    let task_id = claimed[0].task_id;
    EvalTask::set_task_handle(&pool, task_id, "ext-123").await.unwrap();

    assert!(EvalTask::release_claim(&pool, task_id).await.unwrap());

    let task = EvalTask::find_by_id(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Queued.to_string());
    assert!(task.task_handle.is_none());
    assert!(task.started_processing_at.is_none());

    // Releasing an unclaimed task is a no-op
    assert!(!EvalTask::release_claim(&pool, task_id).await.unwrap());
    Ok(())
}
