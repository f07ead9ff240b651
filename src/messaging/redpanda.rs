use async_trait::async_trait;
use rdkafka::{
    config::ClientConfig,
    error::{KafkaError, RDKafkaErrorCode},
    producer::{FutureProducer, FutureRecord},
    util::Timeout,
};
use std::time::Duration;

use super::sink::{MessageSink, SinkError};

// ============================================================================
// Redpanda / Kafka sink
// ============================================================================
//
// Thin wrapper around rdkafka's FutureProducer. Broker errors are mapped to
// SinkError so that the retry policy can tell transient failures (broker
// down, queue full, request timed out) from permanent ones (unknown topic,
// oversized message).
//
// ============================================================================

pub struct RedpandaSink {
    producer: FutureProducer,
    queue_timeout: Duration,
}

impl RedpandaSink {
    pub fn new(brokers: &str, message_timeout: Duration) -> Result<Self, SinkError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", message_timeout.as_millis().to_string())
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .create()
            .map_err(|e| SinkError::Unavailable(format!("Failed to create producer: {}", e)))?;

        tracing::info!(brokers = %brokers, "Created Redpanda producer");

        Ok(Self {
            producer,
            queue_timeout: message_timeout,
        })
    }
}

#[async_trait]
impl MessageSink for RedpandaSink {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), SinkError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        match self
            .producer
            .send(record, Timeout::After(self.queue_timeout))
            .await
        {
            Ok(_) => {
                tracing::debug!(topic = %topic, key = %key, "Published to Redpanda");
                Ok(())
            }
            Err((e, _)) => {
                let error = classify(topic, &e);
                tracing::warn!(
                    topic = %topic,
                    key = %key,
                    error = %e,
                    "Failed to publish to Redpanda"
                );
                Err(error)
            }
        }
    }
}

fn classify(topic: &str, error: &KafkaError) -> SinkError {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::UnknownTopicOrPartition)
        | Some(RDKafkaErrorCode::UnknownTopic)
        | Some(RDKafkaErrorCode::InvalidTopic)
        | Some(RDKafkaErrorCode::TopicAuthorizationFailed) => SinkError::InvalidDestination {
            topic: topic.to_string(),
            reason: error.to_string(),
        },
        Some(RDKafkaErrorCode::MessageSizeTooLarge) | Some(RDKafkaErrorCode::InvalidMessage) => {
            SinkError::Rejected(error.to_string())
        }
        Some(RDKafkaErrorCode::AllBrokersDown)
        | Some(RDKafkaErrorCode::BrokerTransportFailure)
        | Some(RDKafkaErrorCode::Resolve) => SinkError::Unavailable(error.to_string()),
        _ => SinkError::Delivery(error.to_string()),
    }
}
