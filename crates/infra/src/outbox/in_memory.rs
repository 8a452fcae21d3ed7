//! In-memory outbox store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use bankrelay_core::EventId;

use super::retry::RetryPolicy;
use super::row::{OutboxRow, truncate_error};
use super::store::{FailureOutcome, OutboxStats, OutboxStore, OutboxStoreError, lease_expiry};

/// In-memory outbox.
///
/// Every state change happens under the write lock, so the claimability
/// re-check and the lease write are one atomic step.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    rows: RwLock<HashMap<EventId, OutboxRow>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of every row, oldest first.
    pub fn all(&self) -> Result<Vec<OutboxRow>, OutboxStoreError> {
        let rows = self.read()?;
        let mut all: Vec<_> = rows.values().cloned().collect();
        all.sort_by_key(|r| (r.occurred_at, r.id));
        Ok(all)
    }

    pub fn len(&self) -> Result<usize, OutboxStoreError> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, OutboxStoreError> {
        Ok(self.read()?.is_empty())
    }

    /// Insert synchronously. Used by the in-memory unit of work at commit.
    pub(crate) fn insert_all(&self, new_rows: Vec<OutboxRow>) -> Result<(), OutboxStoreError> {
        let mut rows = self.write()?;

        // Validate the whole batch before touching the map.
        let mut seen = std::collections::HashSet::with_capacity(new_rows.len());
        for row in &new_rows {
            if rows.contains_key(&row.id) || !seen.insert(row.id) {
                return Err(OutboxStoreError::AlreadyExists(row.id));
            }
        }

        for row in new_rows {
            rows.insert(row.id, row);
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<EventId, OutboxRow>>, OutboxStoreError> {
        self.rows
            .read()
            .map_err(|_| OutboxStoreError::Storage("outbox lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<EventId, OutboxRow>>, OutboxStoreError> {
        self.rows
            .write()
            .map_err(|_| OutboxStoreError::Storage("outbox lock poisoned".into()))
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn add_range(&self, rows: Vec<OutboxRow>) -> Result<(), OutboxStoreError> {
        self.insert_all(rows)
    }

    async fn claim_batch(
        &self,
        take: usize,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRow>, OutboxStoreError> {
        let locked_until = lease_expiry(now, lease)?;
        if take == 0 {
            return Ok(Vec::new());
        }

        let mut rows = self.write()?;

        let mut candidates: Vec<(DateTime<Utc>, EventId)> = rows
            .values()
            .filter(|r| r.is_claimable(now))
            .map(|r| (r.occurred_at, r.id))
            .collect();
        candidates.sort();
        candidates.truncate(take);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(row) = rows.get_mut(&id) {
                row.locked_by = Some(worker_id.to_string());
                row.locked_until = Some(locked_until);
                claimed.push(row.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_processed(
        &self,
        id: EventId,
        processed_at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        let mut rows = self.write()?;
        let row = rows.get_mut(&id).ok_or(OutboxStoreError::NotFound(id))?;
        if row.is_terminal() {
            return Ok(());
        }

        row.processed_at = Some(processed_at);
        row.error = None;
        row.locked_by = None;
        row.locked_until = None;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: EventId,
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<FailureOutcome, OutboxStoreError> {
        let mut rows = self.write()?;
        let row = rows.get_mut(&id).ok_or(OutboxStoreError::NotFound(id))?;
        if row.is_terminal() {
            return Ok(FailureOutcome::Unchanged);
        }

        let attempts = row.attempts.saturating_add(1);
        let next_attempt_at = policy.next_attempt_at(attempts, now);

        row.attempts = attempts;
        row.error = Some(truncate_error(error));
        row.locked_by = None;
        row.locked_until = None;
        row.next_attempt_at = next_attempt_at;

        match next_attempt_at {
            Some(next_attempt_at) => Ok(FailureOutcome::Retrying {
                attempts,
                next_attempt_at,
            }),
            None => {
                row.dead_lettered_at = Some(now);
                Ok(FailureOutcome::DeadLettered { attempts })
            }
        }
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxRow>, OutboxStoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<OutboxRow>, OutboxStoreError> {
        let rows = self.read()?;
        let mut result: Vec<_> = rows
            .values()
            .filter(|r| r.is_dead_lettered())
            .cloned()
            .collect();

        result.sort_by_key(|r| (r.dead_lettered_at, r.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn requeue_dead_letter(&self, id: EventId) -> Result<OutboxRow, OutboxStoreError> {
        let mut rows = self.write()?;
        let row = rows
            .get_mut(&id)
            .filter(|r| r.is_dead_lettered())
            .ok_or(OutboxStoreError::NotFound(id))?;

        row.attempts = 0;
        row.dead_lettered_at = None;
        row.next_attempt_at = None;
        row.locked_by = None;
        row.locked_until = None;
        Ok(row.clone())
    }

    async fn purge_processed(&self, before: DateTime<Utc>) -> Result<u64, OutboxStoreError> {
        let mut rows = self.write()?;
        let count_before = rows.len();
        rows.retain(|_, r| r.processed_at.is_none_or(|at| at >= before));
        Ok((count_before - rows.len()) as u64)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<OutboxStats, OutboxStoreError> {
        let rows = self.read()?;
        let mut stats = OutboxStats::default();

        for row in rows.values() {
            if row.is_processed() {
                stats.processed += 1;
            } else if row.is_dead_lettered() {
                stats.dead_lettered += 1;
            } else if row.is_leased(now) {
                stats.leased += 1;
            } else if row.is_backing_off(now) {
                stats.retrying += 1;
            } else {
                stats.pending += 1;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    fn row(n: u128, occurred_offset_secs: i64) -> OutboxRow {
        OutboxRow::staged(
            EventId::from_uuid(Uuid::from_u128(n)),
            t0() + chrono::Duration::seconds(occurred_offset_secs),
            "accounts.account.created",
            "{}",
            None,
            None,
            None,
            t0(),
        )
    }

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn duplicate_ids_reject_the_whole_batch() {
        let store = InMemoryOutboxStore::new();
        store.add_range(vec![row(1, 0)]).await.unwrap();

        let err = store.add_range(vec![row(2, 0), row(1, 0)]).await.unwrap_err();
        assert!(matches!(err, OutboxStoreError::AlreadyExists(_)));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn claim_returns_oldest_first_and_respects_take() {
        let store = InMemoryOutboxStore::new();
        store
            .add_range(vec![row(1, 30), row(2, 10), row(3, 20)])
            .await
            .unwrap();

        let claimed = store.claim_batch(2, "w1", LEASE, t0()).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|r| r.id).collect();
        assert_eq!(
            ids,
            vec![
                EventId::from_uuid(Uuid::from_u128(2)),
                EventId::from_uuid(Uuid::from_u128(3)),
            ]
        );
        assert!(claimed.iter().all(|r| r.locked_by.as_deref() == Some("w1")));
    }

    #[tokio::test]
    async fn leased_rows_are_reclaimable_after_expiry() {
        let store = InMemoryOutboxStore::new();
        store.add_range(vec![row(1, 0)]).await.unwrap();

        assert_eq!(store.claim_batch(10, "w1", LEASE, t0()).await.unwrap().len(), 1);
        assert!(store.claim_batch(10, "w2", LEASE, t0()).await.unwrap().is_empty());

        let later = t0() + chrono::Duration::seconds(31);
        let reclaimed = store.claim_batch(10, "w2", LEASE, later).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].locked_by.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn oversized_backoff_keeps_the_store_usable() {
        let store = InMemoryOutboxStore::new();
        let r = row(1, 0);
        let id = r.id;
        store.add_range(vec![r, row(2, 1)]).await.unwrap();

        let huge = Duration::from_secs(1 << 43);
        let policy = RetryPolicy::exponential(10, huge, huge);
        let outcome = store.mark_failed(id, "boom", t0(), &policy).await.unwrap();
        assert_eq!(
            outcome,
            FailureOutcome::Retrying {
                attempts: 1,
                next_attempt_at: t0() + chrono::Duration::days(30),
            }
        );

        let claimed = store.claim_batch(10, "w1", LEASE, t0()).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, EventId::from_uuid(Uuid::from_u128(2)));
    }

    #[tokio::test]
    async fn zero_or_unrepresentable_leases_are_rejected() {
        let store = InMemoryOutboxStore::new();
        store.add_range(vec![row(1, 0)]).await.unwrap();

        for lease in [Duration::ZERO, Duration::from_secs(1 << 43), Duration::MAX] {
            let err = store.claim_batch(10, "w1", lease, t0()).await.unwrap_err();
            assert!(matches!(err, OutboxStoreError::InvalidLease(d) if d == lease));
        }

        let row = store.get(EventId::from_uuid(Uuid::from_u128(1))).await.unwrap().unwrap();
        assert!(row.locked_by.is_none());
        assert_eq!(store.claim_batch(10, "w1", LEASE, t0()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_lease_holder_still_resolves_a_reclaimed_row() {
        let store = InMemoryOutboxStore::new();
        let r = row(1, 0);
        let id = r.id;
        store.add_range(vec![r]).await.unwrap();

        store.claim_batch(1, "w1", LEASE, t0()).await.unwrap();
        let later = t0() + chrono::Duration::seconds(31);
        let reclaimed = store.claim_batch(1, "w2", LEASE, later).await.unwrap();
        assert_eq!(reclaimed[0].locked_by.as_deref(), Some("w2"));

        store.mark_processed(id, later).await.unwrap();
        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.processed_at, Some(later));
        assert!(stored.locked_by.is_none());

        let outcome = store
            .mark_failed(id, "w2 timed out", later, &RetryPolicy::default())
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Unchanged);
    }

    #[tokio::test]
    async fn mark_processed_is_idempotent() {
        let store = InMemoryOutboxStore::new();
        let r = row(1, 0);
        let id = r.id;
        store.add_range(vec![r]).await.unwrap();
        store.claim_batch(1, "w1", LEASE, t0()).await.unwrap();

        store.mark_processed(id, t0()).await.unwrap();
        let first = store.get(id).await.unwrap().unwrap();

        store
            .mark_processed(id, t0() + chrono::Duration::hours(1))
            .await
            .unwrap();
        let second = store.get(id).await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(second.processed_at, Some(t0()));
        assert!(second.locked_by.is_none());
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let store = InMemoryOutboxStore::new();
        let id = EventId::from_uuid(Uuid::from_u128(99));

        assert!(matches!(
            store.mark_processed(id, t0()).await,
            Err(OutboxStoreError::NotFound(_))
        ));
        assert!(matches!(
            store.mark_failed(id, "x", t0(), &RetryPolicy::default()).await,
            Err(OutboxStoreError::NotFound(_))
        ));
        assert!(matches!(
            store.requeue_dead_letter(id).await,
            Err(OutboxStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn mark_failed_on_processed_row_changes_nothing() {
        let store = InMemoryOutboxStore::new();
        let r = row(1, 0);
        let id = r.id;
        store.add_range(vec![r]).await.unwrap();
        store.mark_processed(id, t0()).await.unwrap();

        let outcome = store
            .mark_failed(id, "late failure", t0(), &RetryPolicy::default())
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Unchanged);

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 0);
        assert!(stored.error.is_none());
    }

    #[tokio::test]
    async fn purge_only_removes_old_processed_rows() {
        let store = InMemoryOutboxStore::new();
        let (a, b, c) = (row(1, 0), row(2, 0), row(3, 0));
        let (a_id, b_id) = (a.id, b.id);
        store.add_range(vec![a, b, c]).await.unwrap();

        store.mark_processed(a_id, t0()).await.unwrap();
        store
            .mark_processed(b_id, t0() + chrono::Duration::days(2))
            .await
            .unwrap();

        let purged = store
            .purge_processed(t0() + chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.len().unwrap(), 2);
        assert!(store.get(a_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stats_bucket_every_state() {
        let store = InMemoryOutboxStore::new();
        store
            .add_range(vec![row(1, 0), row(2, 1), row(3, 2), row(4, 3), row(5, 4)])
            .await
            .unwrap();
        let id = |n| EventId::from_uuid(Uuid::from_u128(n));
        let policy = RetryPolicy::exponential(2, Duration::from_secs(2), Duration::from_secs(60));

        store.mark_processed(id(1), t0()).await.unwrap();
        store.mark_failed(id(2), "boom", t0(), &policy).await.unwrap();
        store.mark_failed(id(3), "boom", t0(), &policy).await.unwrap();
        store.mark_failed(id(3), "boom", t0(), &policy).await.unwrap();
        store.claim_batch(1, "w1", LEASE, t0()).await.unwrap();

        let stats = store.stats(t0()).await.unwrap();
        assert_eq!(
            stats,
            OutboxStats {
                pending: 1,
                leased: 1,
                retrying: 1,
                processed: 1,
                dead_lettered: 1,
            }
        );
    }
}
