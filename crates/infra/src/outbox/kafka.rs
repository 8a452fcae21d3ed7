//! Kafka publisher (feature `kafka`).

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tracing::{debug, warn};

use bankrelay_events::{EventPublisher, PublishError};

use crate::config::KafkaConfig;

/// Idempotent producer with `acks=all`; one `publish` resolves once the
/// broker acknowledges the record or the delivery timeout elapses.
pub struct KafkaPublisher {
    producer: FutureProducer,
    config: KafkaConfig,
}

impl KafkaPublisher {
    pub fn new(config: KafkaConfig) -> Result<Self, PublishError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("client.id", &config.client_id)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set(
                "message.timeout.ms",
                config.message_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| PublishError::Unavailable(format!("kafka producer config: {e}")))?;

        Ok(Self { producer, config })
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish(&self, topic: &str, key: &str, message: &str) -> Result<(), PublishError> {
        let record = FutureRecord::to(topic)
            .key(key)
            .payload(message)
            .headers(OwnedHeaders::new().insert(Header {
                key: "content-type",
                value: Some("application/json"),
            }));

        match self
            .producer
            .send(record, Timeout::After(self.config.message_timeout))
            .await
        {
            Ok((partition, offset)) => {
                debug!(topic, key, partition, offset, "kafka delivery acknowledged");
                Ok(())
            }
            Err((e, _)) => {
                warn!(topic, key, error = %e, "kafka delivery failed");
                Err(PublishError::Broker(e.to_string()))
            }
        }
    }
}
