//! Infrastructure layer: outbox storage, processing, and account use cases.

pub mod accounts;
pub mod config;
pub mod outbox;

#[cfg(test)]
mod integration_tests;
