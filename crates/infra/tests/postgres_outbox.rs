//! Postgres outbox store against a live database.
//!
//! Run with `DATABASE_URL=postgres://... cargo test -p bankrelay-infra -- --ignored`.

use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use bankrelay_core::EventId;
use bankrelay_infra::outbox::{
    ClaimStrategy, FailureOutcome, OutboxRow, OutboxStaging, OutboxStore, OutboxStoreError,
    PgUnitOfWork, PostgresOutboxStore, RetryPolicy,
};

const LEASE: Duration = Duration::from_secs(30);

// The tests share one table and claim whatever is claimable.
static DB: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

async fn store(strategy: ClaimStrategy) -> PostgresOutboxStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPool::connect(&url).await.expect("connect");
    let store = PostgresOutboxStore::new(pool).with_claim_strategy(strategy);
    store.migrate().await.expect("migrate");
    store
}

// Postgres keeps microseconds.
fn now() -> DateTime<Utc> {
    Utc::now().duration_trunc(TimeDelta::microseconds(1)).unwrap()
}

fn row(at: DateTime<Utc>) -> OutboxRow {
    OutboxRow::staged(
        EventId::from_uuid(Uuid::now_v7()),
        // Far in the past so these rows sort ahead of anything else in the table.
        at - TimeDelta::days(3650),
        "accounts.account.created",
        r#"{"body":{"kind":"created"}}"#,
        Some(format!("test-{}", Uuid::now_v7().simple())),
        None,
        None,
        at,
    )
}

async fn lease_lifecycle(strategy: ClaimStrategy) {
    let _db = DB.lock().await;
    let store = store(strategy).await;
    let t = now();
    let staged = row(t);
    let id = staged.id;
    store.add_range(vec![staged.clone()]).await.unwrap();

    let err = store.add_range(vec![staged]).await.unwrap_err();
    assert!(matches!(err, OutboxStoreError::AlreadyExists(dup) if dup == id));

    let claimed = store.claim_batch(50, "worker-a", LEASE, t).await.unwrap();
    let mine = claimed.iter().find(|r| r.id == id).expect("row claimed");
    assert_eq!(mine.locked_by.as_deref(), Some("worker-a"));
    assert!(store.claim_batch(50, "worker-b", LEASE, t).await.unwrap().iter().all(|r| r.id != id));

    let policy = RetryPolicy::default();
    let outcome = store.mark_failed(id, "broker down", t, &policy).await.unwrap();
    assert_eq!(
        outcome,
        FailureOutcome::Retrying {
            attempts: 1,
            next_attempt_at: t + TimeDelta::seconds(2),
        }
    );

    let early = store.claim_batch(50, "worker-b", LEASE, t + TimeDelta::seconds(1)).await.unwrap();
    assert!(early.iter().all(|r| r.id != id));

    let later = t + TimeDelta::seconds(2);
    let again = store.claim_batch(50, "worker-b", LEASE, later).await.unwrap();
    assert!(again.iter().any(|r| r.id == id));

    store.mark_processed(id, later).await.unwrap();
    store.mark_processed(id, later + TimeDelta::seconds(5)).await.unwrap();

    let done = store.get(id).await.unwrap().unwrap();
    assert_eq!(done.processed_at, Some(later));
    assert_eq!(done.attempts, 1);
    assert!(done.locked_by.is_none());

    let missing = EventId::from_uuid(Uuid::now_v7());
    assert!(matches!(
        store.mark_processed(missing, later).await,
        Err(OutboxStoreError::NotFound(_))
    ));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn per_row_claims_and_resolves() {
    lease_lifecycle(ClaimStrategy::PerRow).await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn set_based_claims_and_resolves() {
    lease_lifecycle(ClaimStrategy::SetBased).await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn dead_letter_and_requeue() {
    let _db = DB.lock().await;
    let store = store(ClaimStrategy::SetBased).await;
    let t = now();
    let staged = row(t);
    let id = staged.id;
    store.add_range(vec![staged]).await.unwrap();

    let outcome = store.mark_failed(id, "nope", t, &RetryPolicy::no_retry()).await.unwrap();
    assert_eq!(outcome, FailureOutcome::DeadLettered { attempts: 1 });

    let row = store.get(id).await.unwrap().unwrap();
    assert!(row.is_dead_lettered());
    assert!(row.next_attempt_at.is_none());
    assert!(store.claim_batch(50, "w", LEASE, t).await.unwrap().iter().all(|r| r.id != id));

    let requeued = store.requeue_dead_letter(id).await.unwrap();
    assert_eq!(requeued.attempts, 0);
    assert_eq!(requeued.error.as_deref(), Some("nope"));
    store.mark_processed(id, t).await.unwrap();
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn unit_of_work_commits_or_discards_rows() {
    let _db = DB.lock().await;
    let store = store(ClaimStrategy::PerRow).await;
    let t = now();

    let committed = row(t);
    let mut uow = PgUnitOfWork::begin(store.pool()).await.unwrap();
    uow.add_range(vec![committed.clone()]).unwrap();
    uow.commit().await.unwrap();
    assert!(store.get(committed.id).await.unwrap().is_some());

    let discarded = row(t);
    let mut uow = PgUnitOfWork::begin(store.pool()).await.unwrap();
    uow.add_range(vec![discarded.clone()]).unwrap();
    uow.rollback().await.unwrap();
    assert!(store.get(discarded.id).await.unwrap().is_none());

    store.mark_processed(committed.id, t).await.unwrap();
}
