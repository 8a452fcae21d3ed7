//! Integration tests for the outbox pipeline.
//!
//! Use case → unit of work → outbox store → processor → publisher
//!
//! Verifies:
//! - Rows are delivered once on success and retried with backoff on failure
//! - Concurrent claimers never share a row
//! - Exhausted rows are dead-lettered and can be requeued
//! - Business writes and outbox rows commit together or not at all

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};

    use bankrelay_core::{AccountId, Clock, EventId, IdGenerator, ManualClock, SequentialIdGenerator};
    use bankrelay_events::{AccountEvent, AccountEventFactory, InMemoryPublisher, JsonEventSerializer};

    use crate::accounts::{AccountService, InMemoryAccountStore};
    use crate::config::OutboxConfig;
    use crate::outbox::{
        EventDispatcher, FailureOutcome, InMemoryOutboxStore, OutboxProcessor, OutboxRow, OutboxStore,
        RetryPolicy,
    };

    const WORKER: &str = "worker-1";
    const LEASE: Duration = Duration::from_secs(30);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
    }

    fn config() -> OutboxConfig {
        OutboxConfig::default()
            .with_worker_id(WORKER)
            .with_topic("accounts")
            .with_retry_policy(RetryPolicy::exponential(
                10,
                Duration::from_secs(2),
                Duration::from_secs(300),
            ))
    }

    /// One staged `created` row, built the way a use case builds it.
    fn stage_created(clock: &ManualClock, store: &InMemoryOutboxStore) -> EventId {
        let ids = Arc::new(SequentialIdGenerator::new());
        let account = bankrelay_accounts::Account::create(
            AccountId::from_uuid(ids.next_id()),
            bankrelay_accounts::AccountName::new("Ana").unwrap(),
            bankrelay_accounts::Cpf::new("52998224725").unwrap(),
            clock.now(),
        );
        let factory = AccountEventFactory::new(clock.clone(), ids);
        let record = factory.created(&account);
        let id = record.event_id();

        let mut staged: Vec<OutboxRow> = Vec::new();
        EventDispatcher::new(JsonEventSerializer, clock.clone())
            .enqueue(&mut staged, &[record], Some("req-1"))
            .unwrap();
        store.insert_all(staged).unwrap();
        id
    }

    fn claimed_ids(rows: &[OutboxRow]) -> Vec<EventId> {
        rows.iter().map(|r| r.id).collect()
    }

    #[tokio::test]
    async fn successful_publish_processes_the_row_once() {
        let clock = ManualClock::new(t0());
        let store = InMemoryOutboxStore::arc();
        let publisher = Arc::new(InMemoryPublisher::new());
        let id = stage_created(&clock, &store);

        let processor = OutboxProcessor::new(store.clone(), publisher.clone(), clock.clone(), config());
        let report = processor.run_once().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.published, 1);

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.processed_at, Some(t0()));
        assert!(row.locked_by.is_none() && row.error.is_none());

        let again = processor.run_once().await.unwrap();
        assert_eq!(again.claimed, 0);
        assert_eq!(publisher.published().len(), 1);
    }

    #[tokio::test]
    async fn failed_publish_waits_out_backoff() {
        let clock = ManualClock::new(t0());
        let store = InMemoryOutboxStore::arc();
        let publisher = Arc::new(InMemoryPublisher::new());
        let id = stage_created(&clock, &store);
        publisher.fail_next(1);

        let processor = OutboxProcessor::new(store.clone(), publisher.clone(), clock.clone(), config());
        let report = processor.run_once().await.unwrap();
        assert_eq!(report.retried, 1);

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.attempts, 1);
        assert!(row.error.is_some());
        assert_eq!(row.next_attempt_at, Some(t0() + chrono::Duration::seconds(2)));

        clock.advance(chrono::Duration::milliseconds(1999));
        let early = store.claim_batch(10, WORKER, LEASE, clock.now()).await.unwrap();
        assert!(early.is_empty());

        clock.advance(chrono::Duration::milliseconds(1));
        let report = processor.run_once().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.published, 1);
        assert!(store.get(id).await.unwrap().unwrap().is_processed());
    }

    #[test]
    fn concurrent_claimers_never_share_a_row() {
        for _ in 0..25 {
            let clock = ManualClock::new(t0());
            let store = InMemoryOutboxStore::arc();
            let id = stage_created(&clock, &store);
            let barrier = Arc::new(Barrier::new(2));

            let workers: Vec<_> = ["worker-a", "worker-b"]
                .into_iter()
                .map(|worker| {
                    let store = store.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        let runtime = tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                            .unwrap();
                        barrier.wait();
                        runtime
                            .block_on(store.claim_batch(1, worker, LEASE, t0()))
                            .unwrap()
                    })
                })
                .collect();

            let results: Vec<Vec<OutboxRow>> =
                workers.into_iter().map(|h| h.join().unwrap()).collect();
            let winners: Vec<_> = results.iter().filter(|r| !r.is_empty()).collect();
            assert_eq!(winners.len(), 1);
            assert_eq!(claimed_ids(winners[0]), vec![id]);
        }
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_by_another_worker() {
        let clock = ManualClock::new(t0());
        let store = InMemoryOutboxStore::arc();
        let id = stage_created(&clock, &store);

        let first = store.claim_batch(10, "worker-a", LEASE, clock.now()).await.unwrap();
        assert_eq!(claimed_ids(&first), vec![id]);

        clock.advance(chrono::Duration::seconds(30));
        assert!(store.claim_batch(10, "worker-b", LEASE, clock.now()).await.unwrap().is_empty());

        clock.advance(chrono::Duration::milliseconds(1));
        let second = store.claim_batch(10, "worker-b", LEASE, clock.now()).await.unwrap();
        assert_eq!(second[0].locked_by.as_deref(), Some("worker-b"));
    }

    #[tokio::test]
    async fn exhausted_rows_are_dead_lettered_and_requeueable() {
        let clock = ManualClock::new(t0());
        let store = InMemoryOutboxStore::arc();
        let publisher = Arc::new(InMemoryPublisher::new());
        let id = stage_created(&clock, &store);
        publisher.fail_next(usize::MAX);

        let policy = RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(60));
        let processor = OutboxProcessor::new(
            store.clone(),
            publisher.clone(),
            clock.clone(),
            config().with_retry_policy(policy),
        );

        for _ in 0..3 {
            processor.run_once().await.unwrap();
            clock.advance(chrono::Duration::seconds(120));
        }

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.attempts, 3);
        assert!(row.is_dead_lettered());
        assert!(row.next_attempt_at.is_none());
        assert!(processor.run_once().await.unwrap().claimed == 0);

        let dead = store.list_dead_letters(10).await.unwrap();
        assert_eq!(claimed_ids(&dead), vec![id]);

        let outcome = store.mark_failed(id, "late", clock.now(), &policy).await.unwrap();
        assert_eq!(outcome, FailureOutcome::Unchanged);

        publisher.fail_next(0);
        let requeued = store.requeue_dead_letter(id).await.unwrap();
        assert_eq!(requeued.attempts, 0);

        let report = processor.run_once().await.unwrap();
        assert_eq!(report.published, 1);
        assert!(store.get(id).await.unwrap().unwrap().is_processed());
    }

    #[tokio::test]
    async fn account_changes_flow_to_the_bus_in_order() {
        let clock = ManualClock::new(t0());
        let accounts = Arc::new(InMemoryAccountStore::new());
        let store = InMemoryOutboxStore::arc();
        let publisher = Arc::new(InMemoryPublisher::new());

        let service = AccountService::new(
            accounts,
            store.clone(),
            Arc::new(clock.clone()),
            Arc::new(SequentialIdGenerator::new()),
        );
        let account = service.create("Ana", "52998224725", Some("req-9")).unwrap();
        clock.advance(chrono::Duration::seconds(1));
        service.change_name(account.id_typed(), "Ana Clara", Some("req-10")).unwrap();

        let processor = OutboxProcessor::new(store.clone(), publisher.clone(), clock.clone(), config());
        let report = processor.run_once().await.unwrap();
        assert_eq!(report.published, 3);

        let published = publisher.published();
        let expected_key = account.id_typed().simple();
        assert!(published.iter().all(|m| m.key == expected_key));

        let types: Vec<String> = published
            .iter()
            .map(|m| {
                let json: serde_json::Value = serde_json::from_str(&m.message).unwrap();
                json["type"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(
            types,
            vec![
                "accounts.account.created",
                "accounts.account.name_changed",
                "accounts.account.updated",
            ]
        );

        let first: serde_json::Value = serde_json::from_str(&published[0].message).unwrap();
        let body: AccountEvent = serde_json::from_value(first["payload"]["body"].clone()).unwrap();
        assert!(matches!(body, AccountEvent::Created { .. }));
        assert_eq!(first["correlationId"], "req-9");
    }

    #[tokio::test]
    async fn every_staged_row_ends_processed_under_flaky_publishing() {
        let clock = ManualClock::new(t0());
        let accounts = Arc::new(InMemoryAccountStore::new());
        let store = InMemoryOutboxStore::arc();
        let publisher = Arc::new(InMemoryPublisher::new());

        let service = AccountService::new(
            accounts,
            store.clone(),
            Arc::new(clock.clone()),
            Arc::new(SequentialIdGenerator::new()),
        );
        for n in 0..10 {
            service.create(&format!("Holder {n}"), &format!("{n:011}"), None).unwrap();
        }

        let processor = OutboxProcessor::new(
            store.clone(),
            publisher.clone(),
            clock.clone(),
            config().with_batch_size(3),
        );
        for round in 0..20 {
            if round % 2 == 0 {
                publisher.fail_next(1);
            }
            processor.run_once().await.unwrap();
            clock.advance(chrono::Duration::seconds(5));
        }

        let stats = store.stats(clock.now()).await.unwrap();
        assert_eq!(stats.processed, 10);
        assert_eq!(stats.pending + stats.retrying + stats.leased + stats.dead_lettered, 0);
        assert_eq!(publisher.published().len(), 10);
    }

    #[test]
    fn rejected_commit_leaves_no_trace() {
        let clock = ManualClock::new(t0());
        let accounts = Arc::new(InMemoryAccountStore::new());
        let store = InMemoryOutboxStore::arc();

        // Both services mint the same first event id, so the second commit collides.
        let service = |ids: SequentialIdGenerator| {
            AccountService::new(accounts.clone(), store.clone(), Arc::new(clock.clone()), Arc::new(ids))
        };
        let first = service(SequentialIdGenerator::new());
        let second = service(SequentialIdGenerator::new());

        first.create("Ana", "52998224725", None).unwrap();
        let before = store.len().unwrap();

        assert!(second.create("Bia", "11144477735", None).is_err());
        assert_eq!(store.len().unwrap(), before);
        assert!(accounts.find_by_cpf(&bankrelay_accounts::Cpf::new("11144477735").unwrap()).unwrap().is_none());
    }
}
