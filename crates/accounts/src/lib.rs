//! Accounts domain module.
//!
//! The `Account` aggregate is the business collaborator whose transitions the
//! outbox publishes. It holds state and enforces its lifecycle rules; it does
//! no IO and builds no events itself.

pub mod account;

pub use account::{Account, AccountName, Cpf};
