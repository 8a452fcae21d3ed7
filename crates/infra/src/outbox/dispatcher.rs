//! Event records -> staged outbox rows.

use tracing::debug;

use bankrelay_core::Clock;
use bankrelay_events::{Event, EventRecord, EventSerializer, SerializationError};

use super::row::OutboxRow;
use super::store::OutboxStoreError;
use super::unit_of_work::OutboxStaging;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error("failed to stage outbox rows: {0}")]
    Staging(#[from] OutboxStoreError),
}

/// Serializes records and stages them in the caller's unit of work.
///
/// Never commits and never talks to the broker; the surrounding unit of work
/// decides whether the rows ever exist.
pub struct EventDispatcher<S, C> {
    serializer: S,
    clock: C,
}

impl<S, C> EventDispatcher<S, C>
where
    S: EventSerializer,
    C: Clock,
{
    pub fn new(serializer: S, clock: C) -> Self {
        Self { serializer, clock }
    }

    /// Stage one row per record. Returns the number of rows staged.
    ///
    /// Every record is serialized before anything is staged, so a failure
    /// leaves `staging` untouched.
    pub fn enqueue<E, T>(
        &self,
        staging: &mut T,
        events: &[EventRecord<E>],
        correlation_id: Option<&str>,
    ) -> Result<usize, DispatchError>
    where
        E: Event,
        T: OutboxStaging + ?Sized,
    {
        if events.is_empty() {
            return Ok(0);
        }

        let created_at = self.clock.now();
        let rows = events
            .iter()
            .map(|record| self.to_row(record, correlation_id, created_at))
            .collect::<Result<Vec<_>, _>>()?;

        let count = rows.len();
        staging.add_range(rows)?;

        debug!(
            row_count = count,
            correlation_id = correlation_id.unwrap_or_default(),
            "staged outbox rows"
        );
        Ok(count)
    }

    fn to_row<E: Event>(
        &self,
        record: &EventRecord<E>,
        correlation_id: Option<&str>,
        created_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<OutboxRow, SerializationError> {
        let payload = self.serializer.serialize(record)?;
        let (aggregate_id, key) = match record.aggregate_key() {
            Some(k) => (Some(k.aggregate_id.clone()), k.key.clone()),
            None => (None, None),
        };

        Ok(OutboxRow::staged(
            record.event_id(),
            record.occurred_at(),
            self.serializer.type_tag(record),
            payload,
            correlation_id.map(str::to_string),
            aggregate_id,
            key,
            created_at,
        ))
    }
}
