use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::outbox::{EventId, OutboxEvent};

// ============================================================================
// Wire Envelopes - what consumers actually receive
// ============================================================================
//
// The outbox payload is opaque to the relay except for one expectation: it
// must be JSON so that it can be embedded into the envelope below. Consumers
// deduplicate on `event_id` since delivery is at-least-once.
//
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WireEnvelope {
    // Event Identity
    pub event_id: EventId,
    pub event_version: i32,

    // Source aggregate
    pub aggregate_type: String,
    pub aggregate_id: String,

    pub event_type: String,
    pub occurred_at: DateTime<Utc>,

    /// Delivery attempt that produced this message, 1-based
    pub attempt: i32,

    pub headers: HashMap<String, String>,
    pub payload: serde_json::Value,
}

impl WireEnvelope {
    pub fn from_event(event: &OutboxEvent) -> Result<Self, serde_json::Error> {
        let payload: serde_json::Value = serde_json::from_slice(&event.payload)?;

        Ok(Self {
            event_id: event.event_id,
            event_version: event.event_version,
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            event_type: event.event_type.clone(),
            occurred_at: event.created_at,
            attempt: event.attempt_count,
            headers: event.headers.clone(),
            payload,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Message written to the dead-letter topic. Carries the raw payload as text
/// because the payload itself may be the reason the event could not be sent.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DeadLetterEnvelope {
    pub event_id: EventId,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub attempt_count: i32,
    pub error: String,
    pub first_created_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
    pub headers: HashMap<String, String>,
    pub raw_payload: String,
}

impl DeadLetterEnvelope {
    pub fn new(event: &OutboxEvent, error: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            event_id: event.event_id,
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            event_type: event.event_type.clone(),
            attempt_count: event.attempt_count,
            error: error.into(),
            first_created_at: event.created_at,
            dead_lettered_at: now,
            headers: event.headers.clone(),
            raw_payload: String::from_utf8_lossy(&event.payload).into_owned(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

// ============================================================================
// Topic naming
// ============================================================================

const MAX_TOPIC_LEN: usize = 249;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Cannot derive topic from aggregate type '{aggregate_type}': {reason}")]
pub struct InvalidTopic {
    pub aggregate_type: String,
    pub reason: &'static str,
}

/// Maps an aggregate type to `{prefix}.{aggregate_type}` (lowercased)
#[derive(Debug, Clone)]
pub struct TopicResolver {
    prefix: String,
}

impl TopicResolver {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn resolve(&self, aggregate_type: &str) -> Result<String, InvalidTopic> {
        let invalid = |reason| InvalidTopic {
            aggregate_type: aggregate_type.to_string(),
            reason,
        };

        if aggregate_type.is_empty() {
            return Err(invalid("empty aggregate type"));
        }

        let topic = if self.prefix.is_empty() {
            aggregate_type.to_ascii_lowercase()
        } else {
            format!("{}.{}", self.prefix, aggregate_type.to_ascii_lowercase())
        };

        if topic.len() > MAX_TOPIC_LEN {
            return Err(invalid("topic name too long"));
        }
        if !topic
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(invalid("topic may only contain [a-zA-Z0-9._-]"));
        }

        Ok(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::NewOutboxEvent;

    fn row(payload: &[u8]) -> OutboxEvent {
        let mut row = OutboxEvent::pending(
            NewOutboxEvent::new(12, "Order", "order-12", "OrderPlaced", payload.to_vec())
                .with_header("correlation-id", "c-1"),
        );
        row.attempt_count = 2;
        row
    }

    #[test]
    fn test_envelope_embeds_json_payload() {
        let envelope = WireEnvelope::from_event(&row(br#"{"total":42}"#)).unwrap();
        assert_eq!(envelope.event_id, 12);
        assert_eq!(envelope.attempt, 2);
        assert_eq!(envelope.payload["total"], 42);

        let bytes = envelope.to_bytes().unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded["event_type"], "OrderPlaced");
        assert_eq!(decoded["headers"]["correlation-id"], "c-1");
    }

    #[test]
    fn test_envelope_rejects_non_json_payload() {
        assert!(WireEnvelope::from_event(&row(b"\x00\x01 not json")).is_err());
    }

    #[test]
    fn test_dead_letter_envelope_keeps_raw_payload() {
        let now = Utc::now();
        let envelope = DeadLetterEnvelope::new(&row(b"not json"), "bad payload", now);
        assert_eq!(envelope.raw_payload, "not json");
        assert_eq!(envelope.error, "bad payload");
        assert_eq!(envelope.dead_lettered_at, now);
    }

    #[test]
    fn test_topic_resolution() {
        let resolver = TopicResolver::new("outbox");
        assert_eq!(resolver.resolve("Order").unwrap(), "outbox.order");
        assert_eq!(resolver.resolve("payment_intent").unwrap(), "outbox.payment_intent");
        assert!(resolver.resolve("").is_err());
        assert!(resolver.resolve("Order Line").is_err());
        assert!(resolver.resolve(&"x".repeat(300)).is_err());
        assert_eq!(TopicResolver::new("").resolve("Order").unwrap(), "order");
    }
}
