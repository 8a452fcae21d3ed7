//! Outbox store abstraction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use bankrelay_core::EventId;

use super::retry::RetryPolicy;
use super::row::OutboxRow;

/// Outbox store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OutboxStoreError {
    #[error("outbox row not found: {0}")]
    NotFound(EventId),
    #[error("outbox row already exists: {0}")]
    AlreadyExists(EventId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid lease duration: {0:?}")]
    InvalidLease(Duration),
}

/// Lease expiry for a claim at `now`. Zero and out-of-range leases are rejected.
pub(crate) fn lease_expiry(
    now: DateTime<Utc>,
    lease: Duration,
) -> Result<DateTime<Utc>, OutboxStoreError> {
    if lease.is_zero() {
        return Err(OutboxStoreError::InvalidLease(lease));
    }
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or(OutboxStoreError::InvalidLease(lease))
}

/// What `mark_failed` did to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Scheduled for another attempt.
    Retrying {
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Attempts exhausted; the row is terminal until requeued.
    DeadLettered { attempts: u32 },
    /// The row was already terminal and nothing changed.
    Unchanged,
}

/// Row counts by state at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct OutboxStats {
    /// Claimable now.
    pub pending: usize,
    /// Held under an unexpired lease.
    pub leased: usize,
    /// Failed at least once and waiting out backoff.
    pub retrying: usize,
    pub processed: usize,
    pub dead_lettered: usize,
}

/// Persisted append-only outbox with a claim/lease protocol.
///
/// Any number of workers may call `claim_batch` concurrently; a row is handed
/// to at most one of them per lease window. Implementations must re-check
/// claimability at write time rather than trusting an earlier read.
///
/// Resolution is not fenced by the lease holder. `mark_processed` and
/// `mark_failed` act on the row whoever holds it, so a worker whose lease
/// expired mid-publish can still resolve a row another worker has since
/// claimed. Delivery is at-least-once either way; the first resolution wins
/// and later ones leave a terminal row unchanged.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Append rows. A duplicate id fails the whole call with `AlreadyExists`.
    async fn add_range(&self, rows: Vec<OutboxRow>) -> Result<(), OutboxStoreError>;

    /// Lease up to `take` claimable rows for `worker_id`, oldest first.
    /// Returns immediately (possibly empty); never waits for work.
    /// A zero lease, or one that overflows the calendar from `now`, fails
    /// with `InvalidLease`.
    async fn claim_batch(
        &self,
        take: usize,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRow>, OutboxStoreError>;

    /// Resolve a row as delivered. Calling it again changes nothing.
    /// Does not check `locked_by`.
    async fn mark_processed(
        &self,
        id: EventId,
        processed_at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError>;

    /// Record a failed publish: bump attempts, store the error, release the
    /// lease, and either schedule a retry or dead-letter the row. Does not
    /// check `locked_by`.
    async fn mark_failed(
        &self,
        id: EventId,
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<FailureOutcome, OutboxStoreError>;

    async fn get(&self, id: EventId) -> Result<Option<OutboxRow>, OutboxStoreError>;

    /// Dead-lettered rows, oldest first.
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<OutboxRow>, OutboxStoreError>;

    /// Make a dead-lettered row claimable again with a fresh attempt budget.
    /// The last error is kept for inspection.
    async fn requeue_dead_letter(&self, id: EventId) -> Result<OutboxRow, OutboxStoreError>;

    /// Delete processed rows whose `processed_at` is before the cutoff.
    async fn purge_processed(&self, before: DateTime<Utc>) -> Result<u64, OutboxStoreError>;

    async fn stats(&self, now: DateTime<Utc>) -> Result<OutboxStats, OutboxStoreError>;
}

#[async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn add_range(&self, rows: Vec<OutboxRow>) -> Result<(), OutboxStoreError> {
        (**self).add_range(rows).await
    }

    async fn claim_batch(
        &self,
        take: usize,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRow>, OutboxStoreError> {
        (**self).claim_batch(take, worker_id, lease, now).await
    }

    async fn mark_processed(
        &self,
        id: EventId,
        processed_at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        (**self).mark_processed(id, processed_at).await
    }

    async fn mark_failed(
        &self,
        id: EventId,
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<FailureOutcome, OutboxStoreError> {
        (**self).mark_failed(id, error, now, policy).await
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxRow>, OutboxStoreError> {
        (**self).get(id).await
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<OutboxRow>, OutboxStoreError> {
        (**self).list_dead_letters(limit).await
    }

    async fn requeue_dead_letter(&self, id: EventId) -> Result<OutboxRow, OutboxStoreError> {
        (**self).requeue_dead_letter(id).await
    }

    async fn purge_processed(&self, before: DateTime<Utc>) -> Result<u64, OutboxStoreError> {
        (**self).purge_processed(before).await
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<OutboxStats, OutboxStoreError> {
        (**self).stats(now).await
    }
}
