use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::messaging::{DeadLetterEnvelope, MessageSink};
use crate::outbox::{OutboxStore, OutboxStoreError};
use crate::relay::publisher::FailedEvent;

// ============================================================================
// Dead-Letter Router
// ============================================================================
//
// Events that can never be delivered (bad payload, bad destination) or that
// ran out of attempts are copied to a single dead-letter topic and then
// parked in DEAD_LETTER. If the dead-letter topic itself is unreachable the
// row is scheduled for another attempt instead, so nothing is dropped.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterOutcome {
    DeadLettered,
    Rescheduled,
    /// Row no longer in SENDING (reclaimed by another relay)
    Skipped,
}

pub struct DeadLetterRouter {
    sink: Arc<dyn MessageSink>,
    topic: String,
    publish_timeout: Duration,
}

impl DeadLetterRouter {
    pub fn new(sink: Arc<dyn MessageSink>, topic: impl Into<String>, publish_timeout: Duration) -> Self {
        Self {
            sink,
            topic: topic.into(),
            publish_timeout,
        }
    }

    /// Publish the failed event to the dead-letter topic and mark it terminal.
    /// `retry_delay` is used only when the dead-letter publish fails, and
    /// counts from the moment that failure is recorded.
    pub async fn route(
        &self,
        store: &dyn OutboxStore,
        failed: &FailedEvent,
        retry_delay: Duration,
    ) -> Result<DeadLetterOutcome, OutboxStoreError> {
        let event = &failed.event;
        let cause = failed.error.to_string();
        let envelope = DeadLetterEnvelope::new(event, cause.clone(), Utc::now());
        let key = event.event_id.to_string();

        let delivered = match envelope.to_bytes() {
            Ok(bytes) => match timeout(self.publish_timeout, self.sink.publish(&self.topic, &key, &bytes)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("dead-letter publish timed out after {:?}", self.publish_timeout)),
            },
            Err(e) => Err(e.to_string()),
        };

        match delivered {
            Ok(()) => {
                let marked = store.mark_dead_lettered(event.event_id, &cause, Utc::now()).await?;
                if marked {
                    tracing::warn!(
                        event_id = event.event_id,
                        attempt = event.attempt_count,
                        dlq_topic = %self.topic,
                        error = %cause,
                        "☠️ Outbox event moved to dead-letter topic"
                    );
                    Ok(DeadLetterOutcome::DeadLettered)
                } else {
                    Ok(DeadLetterOutcome::Skipped)
                }
            }
            Err(dlq_error) => {
                tracing::error!(
                    event_id = event.event_id,
                    dlq_topic = %self.topic,
                    error = %dlq_error,
                    "Dead-letter publish failed, rescheduling event"
                );
                let cause = format!("{} (dead-letter publish failed: {})", cause, dlq_error);
                let marked = store
                    .mark_failed_with_backoff(event.event_id, &cause, retry_delay, Utc::now())
                    .await?;
                Ok(if marked {
                    DeadLetterOutcome::Rescheduled
                } else {
                    DeadLetterOutcome::Skipped
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use crate::outbox::{InMemoryOutboxStore, NewOutboxEvent, OutboxStatus};
    use crate::relay::publisher::testing::RecordingSink;
    use crate::relay::publisher::PublishError;

    async fn claimed_failure(store: &InMemoryOutboxStore, now: DateTime<Utc>) -> FailedEvent {
        store
            .save(NewOutboxEvent::new(7, "Order", "order-7", "OrderPlaced", b"not json".to_vec()).with_created_at(now))
            .await
            .unwrap();
        let event = store
            .claim(10, now, Duration::from_secs(60))
            .await
            .unwrap()
            .remove(0);
        FailedEvent {
            event,
            error: PublishError::Serialization("expected value".to_string()),
            retryable: false,
        }
    }

    #[tokio::test]
    async fn test_routes_to_dead_letter_topic() {
        let now = Utc::now();
        let store = InMemoryOutboxStore::new();
        let failed = claimed_failure(&store, now).await;
        let sink = Arc::new(RecordingSink::default());
        let router = DeadLetterRouter::new(sink.clone(), "outbox.dead-letter", Duration::from_secs(1));

        let outcome = router
            .route(&store, &failed, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(outcome, DeadLetterOutcome::DeadLettered);
        let row = store.get(7).await.unwrap();
        assert_eq!(row.status, OutboxStatus::DeadLettered);
        assert!(row.last_error.unwrap().contains("Serialization"));

        let published = sink.published.lock().unwrap().clone();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "outbox.dead-letter");
        assert_eq!(published[0].1, "7");
        let envelope: DeadLetterEnvelope = serde_json::from_slice(&published[0].2).unwrap();
        assert_eq!(envelope.raw_payload, "not json");
        assert_eq!(envelope.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_reschedules_when_dead_letter_topic_unavailable() {
        let now = Utc::now();
        let store = InMemoryOutboxStore::new();
        let failed = claimed_failure(&store, now).await;
        let sink = Arc::new(RecordingSink::default());
        *sink.fail_topic.lock().unwrap() = Some("outbox.dead-letter".to_string());
        let router = DeadLetterRouter::new(sink, "outbox.dead-letter", Duration::from_secs(1));

        let outcome = router
            .route(&store, &failed, Duration::from_secs(5))
            .await
            .unwrap();
        let routed_at = Utc::now();

        assert_eq!(outcome, DeadLetterOutcome::Rescheduled);
        let row = store.get(7).await.unwrap();
        assert_eq!(row.status, OutboxStatus::Failed);
        assert!(row.next_retry_at <= routed_at + chrono::Duration::seconds(5));
        assert!(row.next_retry_at >= now + chrono::Duration::seconds(5));
    }

    #[tokio::test]
    async fn test_reschedule_counts_from_dead_letter_failure() {
        let now = Utc::now();
        let store = InMemoryOutboxStore::new();
        let failed = claimed_failure(&store, now).await;
        // Dead-letter publish hangs until the router's 300ms timeout
        let sink = Arc::new(RecordingSink::slow(Duration::from_secs(10)));
        let router = DeadLetterRouter::new(sink, "outbox.dead-letter", Duration::from_millis(300));

        let outcome = router
            .route(&store, &failed, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(outcome, DeadLetterOutcome::Rescheduled);
        let row = store.get(7).await.unwrap();
        assert!(row.last_error.unwrap().contains("dead-letter publish timed out"));
        assert!(row.next_retry_at >= now + chrono::Duration::milliseconds(5_300));
    }
}
