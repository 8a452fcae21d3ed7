//! Event records and the outbound side of the outbox.
//!
//! - [`event`]: the [`Event`] trait (stable type tag + schema version)
//! - [`record`]: immutable [`EventRecord`]s with an optional aggregate key
//! - [`account`]: account lifecycle event bodies
//! - [`factory`]: builds account records from aggregate state
//! - [`serializer`]: payload encoding for outbox rows
//! - [`envelope`]: the JSON message published to the bus
//! - [`bus`] / [`in_memory_bus`]: the publisher seam and a test double

pub mod account;
pub mod bus;
pub mod envelope;
pub mod event;
pub mod factory;
pub mod in_memory_bus;
pub mod record;
pub mod serializer;

pub use account::AccountEvent;
pub use bus::{EventPublisher, PublishError};
pub use envelope::OutboxEnvelope;
pub use event::Event;
pub use factory::AccountEventFactory;
pub use in_memory_bus::{InMemoryPublisher, PublishedMessage};
pub use record::{AggregateKey, EventRecord};
pub use serializer::{EventSerializer, JsonEventSerializer, SerializationError};
