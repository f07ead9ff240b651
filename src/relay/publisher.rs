use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::time::timeout;

use crate::messaging::{MessageSink, SinkError, TopicResolver, WireEnvelope};
use crate::metrics::Metrics;
use crate::outbox::{EventId, OutboxEvent};
use crate::utils::{IsTransient, RetryPolicy};

// ============================================================================
// Batch Publisher - chunked, bounded-concurrency delivery
// ============================================================================
//
//   claimed rows ──► [chunk 1: N tasks] ──► await all
//                    [chunk 2: N tasks] ──► await all
//                    ...
//                                          ▼
//                                     BatchOutcome
//
// At most `chunk_size` publishes are in flight at once. Every publish is
// bounded by `per_item_timeout`; a timed-out publish may still land on the
// broker, which is why consumers must deduplicate on event_id.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// Payload is not valid JSON or the envelope failed to encode
    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Sink(SinkError),

    /// Publish task panicked or was cancelled
    #[error("Publish task failed: {0}")]
    Task(String),
}

impl IsTransient for PublishError {
    fn is_transient(&self) -> bool {
        match self {
            PublishError::Serialization(_) | PublishError::InvalidDestination(_) => false,
            PublishError::Timeout(_) | PublishError::Task(_) => true,
            PublishError::Sink(e) => e.is_transient(),
        }
    }
}

impl From<SinkError> for PublishError {
    fn from(error: SinkError) -> Self {
        match error {
            SinkError::InvalidDestination { topic, reason } => {
                PublishError::InvalidDestination(format!("{}: {}", topic, reason))
            }
            other => PublishError::Sink(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailedEvent {
    pub event: OutboxEvent,
    pub error: PublishError,
    pub retryable: bool,
}

impl IsTransient for FailedEvent {
    fn is_transient(&self) -> bool {
        self.retryable
    }
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub success_ids: Vec<EventId>,
    pub failed: Vec<FailedEvent>,
}

pub struct BatchPublisher {
    sink: Arc<dyn MessageSink>,
    resolver: TopicResolver,
    chunk_size: usize,
    per_item_timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl BatchPublisher {
    pub fn new(
        sink: Arc<dyn MessageSink>,
        resolver: TopicResolver,
        chunk_size: usize,
        per_item_timeout: Duration,
    ) -> Self {
        Self {
            sink,
            resolver,
            chunk_size: chunk_size.max(1),
            per_item_timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn process_batch(&self, rows: Vec<OutboxEvent>, policy: &RetryPolicy) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        for chunk in rows.chunks(self.chunk_size) {
            let handles: Vec<_> = chunk
                .iter()
                .map(|event| {
                    let sink = self.sink.clone();
                    let resolver = self.resolver.clone();
                    let metrics = self.metrics.clone();
                    let per_item_timeout = self.per_item_timeout;
                    let event = event.clone();

                    tokio::spawn(async move {
                        let started = Instant::now();
                        let result = publish_one(sink.as_ref(), &resolver, &event, per_item_timeout).await;
                        if let Some(metrics) = metrics {
                            metrics.observe_publish(started.elapsed().as_secs_f64());
                        }
                        result
                    })
                })
                .collect();

            let results = join_all(handles).await;

            for (event, joined) in chunk.iter().zip(results) {
                let result = match joined {
                    Ok(result) => result,
                    Err(e) => Err(PublishError::Task(e.to_string())),
                };

                match result {
                    Ok(()) => outcome.success_ids.push(event.event_id),
                    Err(error) => {
                        let retryable = policy.should_retry(&error);
                        tracing::warn!(
                            event_id = event.event_id,
                            aggregate_type = %event.aggregate_type,
                            attempt = event.attempt_count,
                            retryable = retryable,
                            error = %error,
                            "Failed to publish outbox event"
                        );
                        outcome.failed.push(FailedEvent {
                            event: event.clone(),
                            error,
                            retryable,
                        });
                    }
                }
            }
        }

        outcome
    }
}

async fn publish_one(
    sink: &dyn MessageSink,
    resolver: &TopicResolver,
    event: &OutboxEvent,
    per_item_timeout: Duration,
) -> Result<(), PublishError> {
    let bytes = WireEnvelope::from_event(event)
        .and_then(|envelope| envelope.to_bytes())
        .map_err(|e| PublishError::Serialization(e.to_string()))?;

    let topic = resolver
        .resolve(&event.aggregate_type)
        .map_err(|e| PublishError::InvalidDestination(e.to_string()))?;

    match timeout(per_item_timeout, sink.publish(&topic, &event.aggregate_id, &bytes)).await {
        Ok(Ok(())) => {
            tracing::debug!(event_id = event.event_id, topic = %topic, "Published outbox event");
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(PublishError::Timeout(per_item_timeout)),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records every publish and fails the configured keys
    #[derive(Default)]
    pub struct RecordingSink {
        pub published: Mutex<Vec<(String, String, Vec<u8>)>>,
        pub fail_keys: Mutex<HashSet<String>>,
        pub failure: Mutex<Option<SinkError>>,
        pub fail_topic: Mutex<Option<String>>,
        pub delay: Option<Duration>,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl RecordingSink {
        pub fn failing(keys: &[&str], error: SinkError) -> Self {
            Self {
                fail_keys: Mutex::new(keys.iter().map(|k| k.to_string()).collect()),
                failure: Mutex::new(Some(error)),
                ..Default::default()
            }
        }

        pub fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Default::default()
            }
        }

        pub fn topics(&self) -> Vec<String> {
            self.published.lock().unwrap().iter().map(|(t, _, _)| t.clone()).collect()
        }
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), SinkError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_topic.lock().unwrap().as_deref() == Some(topic) {
                return Err(SinkError::Unavailable("dead-letter topic down".to_string()));
            }
            if self.fail_keys.lock().unwrap().contains(key) {
                if let Some(error) = self.failure.lock().unwrap().clone() {
                    return Err(error);
                }
            }

            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), key.to_string(), payload.to_vec()));
            Ok(())
        }
    }
}
