//! Transactional outbox.
//!
//! Events are written as rows in the same unit of work as the business change
//! that produced them, then drained to the bus by [`OutboxProcessor`]. Rows
//! move through one lifecycle:
//!
//! ```text
//! pending --claim--> leased --publish ok--> processed
//!                      |
//!                      +--publish err--> backing off --(next_attempt_at)--> pending
//!                      |                   (attempts < max)
//!                      +--publish err--> dead-lettered --requeue--> pending
//!                                          (attempts >= max)
//! ```
//!
//! A lease that expires without a resolution makes the row claimable again,
//! so delivery is at-least-once.

pub mod dispatcher;
pub mod in_memory;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod postgres;
pub mod processor;
pub mod retry;
pub mod row;
pub mod store;
pub mod unit_of_work;

pub use dispatcher::{DispatchError, EventDispatcher};
pub use in_memory::InMemoryOutboxStore;
#[cfg(feature = "kafka")]
pub use kafka::KafkaPublisher;
pub use postgres::{ClaimStrategy, PostgresOutboxStore};
pub use processor::{BatchReport, OutboxProcessor, OutboxProcessorHandle, ProcessorStats};
pub use retry::{BACKOFF_LIMIT, RetryPolicy};
pub use row::{MAX_ERROR_LEN, OutboxRow, truncate_error};
pub use store::{FailureOutcome, OutboxStats, OutboxStore, OutboxStoreError};
pub use unit_of_work::{InMemoryUnitOfWork, OutboxStaging, PgUnitOfWork};
