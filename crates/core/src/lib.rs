//! `bankrelay-core`: shared building blocks for the outbox pipeline.
//!
//! Pure primitives only: identifiers, the domain error model, and the
//! time/identity seams that every other crate receives by injection.

pub mod clock;
pub mod entity;
pub mod error;
pub mod id;
pub mod value_object;

pub use clock::{
    Clock, IdGenerator, ManualClock, SequentialIdGenerator, SystemClock, UuidV7Generator,
};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{AccountId, EventId};
pub use value_object::ValueObject;
