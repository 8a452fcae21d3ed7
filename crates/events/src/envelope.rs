use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::value::RawValue;

use bankrelay_core::EventId;

use crate::serializer::SerializationError;

/// The message published to the bus for one outbox row.
///
/// Notes:
/// - `payload` is the stored body embedded as raw JSON, byte for byte; it is
///   never re-encoded as a string.
/// - Field names are camelCase on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEnvelope {
    #[serde(rename = "type")]
    event_type: String,
    event_id: EventId,
    occurred_on_utc: DateTime<Utc>,
    correlation_id: Option<String>,
    aggregate_id: Option<String>,
    key: Option<String>,
    payload: Box<RawValue>,
}

impl OutboxEnvelope {
    /// Fails only when `payload` is not valid JSON.
    pub fn new(
        event_type: impl Into<String>,
        event_id: EventId,
        occurred_on_utc: DateTime<Utc>,
        correlation_id: Option<String>,
        aggregate_id: Option<String>,
        key: Option<String>,
        payload: String,
    ) -> Result<Self, SerializationError> {
        let payload = RawValue::from_string(payload).map_err(SerializationError::InvalidPayload)?;
        Ok(Self {
            event_type: event_type.into(),
            event_id,
            occurred_on_utc,
            correlation_id,
            aggregate_id,
            key,
            payload,
        })
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn payload(&self) -> &str {
        self.payload.get()
    }

    /// Routing key: `key`, then `aggregate_id`, then `correlation_id`, then the
    /// event id.
    pub fn partition_key(&self) -> String {
        partition_key(
            self.key.as_deref(),
            self.aggregate_id.as_deref(),
            self.correlation_id.as_deref(),
            self.event_id,
        )
    }

    pub fn to_json(&self) -> Result<String, SerializationError> {
        serde_json::to_string(self).map_err(SerializationError::Envelope)
    }
}

/// Partition key precedence shared by the envelope and the stored row.
///
/// The event id fallback uses the compact hex form, like aggregate keys.
pub fn partition_key(
    key: Option<&str>,
    aggregate_id: Option<&str>,
    correlation_id: Option<&str>,
    event_id: EventId,
) -> String {
    key.or(aggregate_id)
        .or(correlation_id)
        .map(str::to_string)
        .unwrap_or_else(|| event_id.simple())
}
