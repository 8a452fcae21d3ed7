//! The persisted outbox row and its state predicates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bankrelay_core::EventId;
use bankrelay_events::envelope;

/// Maximum stored length of `error`, in characters.
pub const MAX_ERROR_LEN: usize = 4000;

/// One staged event.
///
/// The store owns every field after insert; callers only ever see snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRow {
    /// Same as the event id.
    pub id: EventId,
    pub occurred_at: DateTime<Utc>,
    pub event_type: String,
    /// Serialized event body, opaque to the store.
    pub payload: String,
    pub correlation_id: Option<String>,
    pub aggregate_id: Option<String>,
    pub key: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Last failure message.
    pub error: Option<String>,
    pub attempts: u32,
    /// `None` means eligible now (unless terminal).
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OutboxRow {
    /// A freshly staged row: no attempts, no lease, not resolved.
    #[allow(clippy::too_many_arguments)]
    pub fn staged(
        id: EventId,
        occurred_at: DateTime<Utc>,
        event_type: impl Into<String>,
        payload: impl Into<String>,
        correlation_id: Option<String>,
        aggregate_id: Option<String>,
        key: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            occurred_at,
            event_type: event_type.into(),
            payload: payload.into(),
            correlation_id,
            aggregate_id,
            key,
            processed_at: None,
            error: None,
            attempts: 0,
            next_attempt_at: None,
            locked_by: None,
            locked_until: None,
            dead_lettered_at: None,
            created_at,
        }
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    pub fn is_dead_lettered(&self) -> bool {
        self.dead_lettered_at.is_some()
    }

    /// Processed or dead-lettered.
    pub fn is_terminal(&self) -> bool {
        self.is_processed() || self.is_dead_lettered()
    }

    /// Eligible to be leased at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal()
            && self.next_attempt_at.is_none_or(|at| at <= now)
            && self.locked_until.is_none_or(|until| until < now)
    }

    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal() && self.locked_until.is_some_and(|until| until >= now)
    }

    /// Waiting out a backoff window.
    pub fn is_backing_off(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal()
            && !self.is_leased(now)
            && self.next_attempt_at.is_some_and(|at| at > now)
    }

    pub fn partition_key(&self) -> String {
        envelope::partition_key(
            self.key.as_deref(),
            self.aggregate_id.as_deref(),
            self.correlation_id.as_deref(),
            self.id,
        )
    }
}

/// Clip a failure message to the column width.
pub fn truncate_error(error: &str) -> String {
    match error.char_indices().nth(MAX_ERROR_LEN) {
        Some((cut, _)) => error[..cut].to_string(),
        None => error.to_string(),
    }
}
