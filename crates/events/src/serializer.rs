//! Payload encoding for outbox rows.

use thiserror::Error;

use crate::event::Event;
use crate::record::EventRecord;

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("failed to encode {event_type}: {source}")]
    Encode {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("payload is not valid JSON: {0}")]
    InvalidPayload(#[source] serde_json::Error),

    #[error("failed to encode envelope: {0}")]
    Envelope(#[source] serde_json::Error),
}

/// Turns records into stored payloads and names their type.
pub trait EventSerializer: Send + Sync {
    fn serialize<E: Event>(&self, record: &EventRecord<E>) -> Result<String, SerializationError>;

    fn type_tag<E: Event>(&self, record: &EventRecord<E>) -> String;
}

/// Compact camelCase JSON (`{"eventId":..,"occurredOnUtc":..,"body":{..}}`).
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonEventSerializer;

impl EventSerializer for JsonEventSerializer {
    fn serialize<E: Event>(&self, record: &EventRecord<E>) -> Result<String, SerializationError> {
        serde_json::to_string(record).map_err(|source| SerializationError::Encode {
            event_type: record.event_type().to_string(),
            source,
        })
    }

    fn type_tag<E: Event>(&self, record: &EventRecord<E>) -> String {
        record.event_type().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountEvent;
    use bankrelay_core::{AccountId, EventId};
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    #[test]
    fn payload_contains_record_metadata_and_body() {
        let record = EventRecord::new(
            EventId::from_uuid(Uuid::from_u128(9)),
            Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
            AccountEvent::Activated {
                account_id: AccountId::from_uuid(Uuid::from_u128(1)),
            },
            None,
        );

        let payload = JsonEventSerializer.serialize(&record).unwrap();
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();

        assert_eq!(json["eventId"], "00000000-0000-0000-0000-000000000009");
        assert_eq!(json["occurredOnUtc"], "2026-01-02T03:04:05Z");
        assert_eq!(json["version"], 1);
        assert_eq!(json["body"]["kind"], "activated");
        assert!(json.get("aggregateKey").is_none());
        assert_eq!(JsonEventSerializer.type_tag(&record), "accounts.account.activated");
    }
}
