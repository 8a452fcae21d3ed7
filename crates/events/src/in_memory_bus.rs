//! In-memory publisher for tests/dev.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::bus::{EventPublisher, PublishError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub key: String,
    pub message: String,
}

#[derive(Debug, Default)]
struct State {
    published: Vec<PublishedMessage>,
    attempts: usize,
    fail_next: usize,
    failing_keys: HashSet<String>,
}

/// Records every accepted message in order.
///
/// Failures can be scripted two ways:
/// - `fail_next(n)`: the next `n` publishes fail regardless of key
/// - `fail_key(k)`: every publish for key `k` fails until `heal_key(k)`
#[derive(Debug, Default)]
pub struct InMemoryPublisher {
    state: Mutex<State>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: usize) {
        self.with_state(|s| s.fail_next = count);
    }

    pub fn fail_key(&self, key: impl Into<String>) {
        let key = key.into();
        self.with_state(|s| {
            s.failing_keys.insert(key);
        });
    }

    pub fn heal_key(&self, key: &str) {
        self.with_state(|s| {
            s.failing_keys.remove(key);
        });
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.with_state(|s| s.published.clone())
    }

    /// Publish calls seen so far, successful or not.
    pub fn attempts(&self) -> usize {
        self.with_state(|s| s.attempts)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }
}

#[async_trait]
impl EventPublisher for InMemoryPublisher {
    async fn publish(&self, topic: &str, key: &str, message: &str) -> Result<(), PublishError> {
        self.with_state(|s| {
            s.attempts += 1;
            if s.fail_next > 0 {
                s.fail_next -= 1;
                return Err(PublishError::Unavailable("scripted failure".into()));
            }
            if s.failing_keys.contains(key) {
                return Err(PublishError::Broker(format!("key {key} rejected")));
            }
            s.published.push(PublishedMessage {
                topic: topic.to_string(),
                key: key.to_string(),
                message: message.to_string(),
            });
            Ok(())
        })
    }
}
