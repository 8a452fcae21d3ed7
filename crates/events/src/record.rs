use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bankrelay_core::EventId;

use crate::event::Event;

/// Partitioning metadata carried by records that belong to an aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateKey {
    pub aggregate_id: String,
    pub key: Option<String>,
}

impl AggregateKey {
    /// Key that routes by the aggregate itself.
    pub fn for_aggregate(aggregate_id: impl Into<String>) -> Self {
        let aggregate_id = aggregate_id.into();
        Self {
            key: Some(aggregate_id.clone()),
            aggregate_id,
        }
    }
}

/// An immutable event record: identity, capture time, body, and an optional
/// aggregate key.
///
/// Fields are private; a record is only ever built whole and read afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord<E> {
    event_id: EventId,
    occurred_on_utc: DateTime<Utc>,
    /// Body schema version, taken from [`Event::version`] at construction.
    #[serde(default = "first_version")]
    version: u32,
    body: E,
    #[serde(skip)]
    aggregate_key: Option<AggregateKey>,
}

impl<E: Event> EventRecord<E> {
    pub fn new(
        event_id: EventId,
        occurred_on_utc: DateTime<Utc>,
        body: E,
        aggregate_key: Option<AggregateKey>,
    ) -> Self {
        Self {
            event_id,
            occurred_on_utc,
            version: body.version(),
            body,
            aggregate_key,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_on_utc
    }

    pub fn event_type(&self) -> &'static str {
        self.body.event_type()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn body(&self) -> &E {
        &self.body
    }

    pub fn aggregate_key(&self) -> Option<&AggregateKey> {
        self.aggregate_key.as_ref()
    }

    pub fn into_body(self) -> E {
        self.body
    }
}

fn first_version() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Renamed {
        name: String,
    }

    impl Event for Renamed {
        fn event_type(&self) -> &'static str {
            "test.renamed"
        }

        fn version(&self) -> u32 {
            3
        }
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap()
    }

    #[test]
    fn record_carries_the_body_schema_version() {
        let body = Renamed { name: "x".into() };
        let record = EventRecord::new(EventId::from_uuid(Uuid::from_u128(1)), at(), body, None);
        assert_eq!(record.version(), 3);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["version"], 3);
    }

    #[test]
    fn payloads_without_a_version_read_as_first_version() {
        let json = r#"{"eventId":"00000000-0000-0000-0000-000000000001","occurredOnUtc":"2026-01-02T03:04:05Z","body":{"name":"x"}}"#;
        let record: EventRecord<Renamed> = serde_json::from_str(json).unwrap();
        assert_eq!(record.version(), 1);
        assert_eq!(record.occurred_at(), at());
    }
}
