//! Runs against a live database. Set `DATABASE_URL` to enable; without it
//! every test returns early.
//!
//! ```text
//! DATABASE_URL=postgres://localhost/procbus_test cargo test -p procbus-postgres
//! ```
//!
//! Each test creates its own tables and drops them afterwards.

use std::sync::Arc;

use futures::future::join_all;
use procbus::{
    Bus, BusConfig, BusError, HandlerResult, Process, ProcessRepository, ProcessStatus,
    SubStatus, WorkerContext,
};
use procbus_postgres::{PgJobQueue, PgProcessRepository};
use procbus_testing::fixtures::{self, HelloCommand, HELLO, HELLO_TOO};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

async fn connect() -> Option<PgPool> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    };
    Some(PgPool::connect(&url).await.expect("connect to DATABASE_URL"))
}

fn unique(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

async fn repository(pool: &PgPool) -> PgProcessRepository {
    let repository = PgProcessRepository::new(pool.clone())
        .with_table(unique("processes"))
        .unwrap();
    repository.install().await.unwrap();
    repository
}

async fn drop_table(pool: &PgPool, table: &str) {
    sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
        .execute(pool)
        .await
        .unwrap();
}

fn process(handlers: usize) -> Process {
    Process::create(
        "pg-test",
        "test::Instruction",
        (0..handlers).map(|i| format!("h{i}")).collect(),
        Some(3),
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_slot_updates_are_all_kept() {
    let Some(pool) = connect().await else { return };
    let repo = repository(&pool).await;

    let mut p = process(12);
    repo.persist(&mut p).await.unwrap();
    repo.start(p.id()).await.unwrap();

    let mut slots: Vec<usize> = (0..12).collect();
    fastrand::shuffle(&mut slots);
    let writes = slots.iter().map(|&slot| {
        let result = HandlerResult::feedback(format!("slot {slot}")).with_data(json!(slot));
        let repo = repo.clone();
        let id = p.id();
        async move { repo.apply_sub_result(id, slot, SubStatus::Succeed, &result).await }
    });
    for written in join_all(writes).await {
        written.unwrap();
    }

    let stored = repo.retrieve(p.id()).await.unwrap();
    assert!(stored.qualify_as_finished());
    for (slot, sub) in stored.results().iter().enumerate() {
        assert_eq!(sub.status, SubStatus::Succeed);
        assert_eq!(sub.feedback.as_deref(), Some(format!("slot {slot}").as_str()));
    }
    assert_eq!(stored.data().unwrap().len(), 12);

    let finished = repo.finish(p.id()).await.unwrap();
    assert!(finished.is_successful());

    drop_table(&pool, repo.table()).await;
}

#[tokio::test]
async fn transitions_follow_the_process_rules() {
    let Some(pool) = connect().await else { return };
    let repo = repository(&pool).await;

    let mut p = process(2);
    repo.persist(&mut p).await.unwrap();
    assert_eq!(repo.retrieve(p.id()).await.unwrap(), p);

    let started = repo.start(p.id()).await.unwrap();
    assert_eq!(started.status(), ProcessStatus::Pending);
    let again = repo.start(p.id()).await.unwrap();
    assert_eq!(again.started_at(), started.started_at());

    assert!(matches!(
        repo.cancel(p.id()).await,
        Err(BusError::InvalidAction { .. })
    ));
    assert!(matches!(
        repo.finish(p.id()).await,
        Err(BusError::InvalidAction { .. })
    ));

    let empty: Vec<Uuid> = Vec::new();
    repo.apply_sub_result(
        p.id(),
        0,
        SubStatus::Failed,
        &HandlerResult::feedback("nope")
            .with_data(json!([]))
            .with_related(empty),
    )
    .await
    .unwrap();
    let updated = repo
        .apply_sub_result(p.id(), 1, SubStatus::Succeed, &HandlerResult::empty())
        .await
        .unwrap();
    assert!(updated.data().is_none());
    assert!(updated.related().is_none());
    assert_eq!(updated.result_at(0).unwrap().feedback.as_deref(), Some("nope"));

    assert!(matches!(
        repo.apply_sub_result(p.id(), 9, SubStatus::Succeed, &HandlerResult::empty())
            .await,
        Err(BusError::InvalidAction { .. })
    ));

    let finished = repo.finish(p.id()).await.unwrap();
    assert!(finished.is_finished());
    assert!(!finished.is_successful());
    assert!(repo.finish(p.id()).await.unwrap().is_finished());

    let mut fresh = process(1);
    repo.persist(&mut fresh).await.unwrap();
    assert!(repo.cancel(fresh.id()).await.unwrap().is_canceled());

    assert_eq!(repo.count(None).await.unwrap(), 2);
    assert_eq!(repo.count(Some("canceled")).await.unwrap(), 1);
    assert!(matches!(
        repo.count(Some("bogus")).await,
        Err(BusError::InvalidAction { .. })
    ));
    let stats = repo.stats().await.unwrap();
    assert_eq!((stats.finished, stats.canceled, stats.total()), (1, 1, 2));

    repo.delete(fresh.id()).await.unwrap();
    repo.delete(fresh.id()).await.unwrap();
    assert!(matches!(
        repo.retrieve(fresh.id()).await,
        Err(BusError::MissingProcess { .. })
    ));

    drop_table(&pool, repo.table()).await;
}

#[tokio::test]
async fn worker_runs_queued_handlers_to_completion() {
    let Some(pool) = connect().await else { return };
    let repo = Arc::new(repository(&pool).await);
    let queue = PgJobQueue::new(pool.clone())
        .with_table(unique("jobs"))
        .unwrap();
    queue.install().await.unwrap();

    let catalog = Arc::new(fixtures::catalog().unwrap());
    let ctx = WorkerContext::new(
        repo.clone(),
        catalog.clone(),
        Arc::new(fixtures::instructions()),
    );
    let bus = Bus::multiple(repo.clone(), catalog)
        .with_config(
            BusConfig::default()
                .with_always_async(true)
                .with_clean_when_finished(false),
        )
        .with_job_queue(Arc::new(queue.clone()))
        .map::<HelloCommand>([HELLO, HELLO_TOO])
        .build()
        .unwrap();

    let process = bus
        .dispatch(&HelloCommand::new("from the queue"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(queue.stats().await.unwrap().pending, 2);

    assert_eq!(queue.work_once(&ctx, "worker-1", 10).await.unwrap(), 2);
    assert_eq!(queue.work_once(&ctx, "worker-1", 10).await.unwrap(), 0);

    let stored = repo.retrieve(process.id()).await.unwrap();
    assert!(stored.is_successful());
    assert!(stored
        .results()
        .iter()
        .all(|r| r.feedback.as_deref() == Some("from the queue")));

    let stats = queue.stats().await.unwrap();
    assert_eq!((stats.succeeded, stats.outstanding()), (2, 0));

    drop_table(&pool, queue.table()).await;
    drop_table(&pool, repo.table()).await;
}
