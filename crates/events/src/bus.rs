//! Publisher seam between the outbox processor and a message bus.
//!
//! Delivery is **at-least-once**: a row is marked processed only after
//! `publish` returns `Ok`, and a crash between the two republishes it.
//! Consumers must be idempotent (dedupe on `eventId`).

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The broker rejected the message or the transport failed.
    #[error("broker error: {0}")]
    Broker(String),

    /// Delivery was not acknowledged in time.
    #[error("publish timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The publisher cannot accept messages right now.
    #[error("publisher unavailable: {0}")]
    Unavailable(String),
}

/// Key-value publish against a topic.
///
/// Implementations must be safe to share across tasks; the processor holds
/// one behind an `Arc`.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, message: &str) -> Result<(), PublishError>;
}

#[async_trait]
impl<P> EventPublisher for Arc<P>
where
    P: EventPublisher + ?Sized,
{
    async fn publish(&self, topic: &str, key: &str, message: &str) -> Result<(), PublishError> {
        (**self).publish(topic, key, message).await
    }
}
