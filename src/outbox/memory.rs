use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::event::{EventId, NewOutboxEvent, OutboxEvent, OutboxStatus, Partition};
use super::store::{after, to_chrono, truncate_cause, OutboxStore, OutboxStoreError};

// ============================================================================
// In-Memory Outbox Store
// ============================================================================
//
// Single-process implementation of the claim protocol. Each claim selects and
// transitions its rows inside one critical section, which gives the same
// "never double-claim" guarantee the Postgres store gets from row locks.
// Backs the test-suite and the --in-memory dry-run mode.
//
// ============================================================================

pub struct InMemoryOutboxStore {
    rows: Mutex<BTreeMap<EventId, OutboxEvent>>,
    instance_id: Uuid,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            instance_id: Uuid::now_v7(),
        }
    }

    /// Snapshot of a single row
    pub async fn get(&self, id: EventId) -> Option<OutboxEvent> {
        self.rows.lock().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn save(&self, event: NewOutboxEvent) -> Result<bool, OutboxStoreError> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&event.event_id) {
            tracing::debug!(event_id = event.event_id, "Duplicate outbox event ignored");
            return Ok(false);
        }
        rows.insert(event.event_id, OutboxEvent::pending(event));
        Ok(true)
    }

    async fn claim_by_partition(
        &self,
        partition: Partition,
        limit: usize,
        now: DateTime<Utc>,
        stuck_threshold: Duration,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let stuck_threshold = to_chrono(stuck_threshold);
        let mut rows = self.rows.lock().await;

        let mut candidates: Vec<(DateTime<Utc>, EventId)> = rows
            .values()
            .filter(|row| partition.owns(row.event_id) && row.is_claimable(now, stuck_threshold))
            .map(|row| (row.created_at, row.event_id))
            .collect();
        candidates.sort();
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(row) = rows.get_mut(&id) {
                if row.status == OutboxStatus::Sending {
                    tracing::warn!(
                        event_id = id,
                        previous_owner = ?row.claimed_by,
                        "Reclaiming outbox event stuck in SENDING"
                    );
                }
                row.status = OutboxStatus::Sending;
                row.attempt_count += 1;
                row.updated_at = now;
                row.claimed_by = Some(self.instance_id);
                claimed.push(row.clone());
            }
        }

        Ok(claimed)
    }

    async fn mark_published(
        &self,
        ids: &[EventId],
        now: DateTime<Utc>,
    ) -> Result<u64, OutboxStoreError> {
        let mut rows = self.rows.lock().await;
        let mut updated = 0;
        for id in ids {
            if let Some(row) = rows.get_mut(id) {
                if row.status == OutboxStatus::Sending {
                    row.status = OutboxStatus::Published;
                    row.updated_at = now;
                    row.last_error = None;
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn mark_failed_with_backoff(
        &self,
        id: EventId,
        cause: &str,
        backoff: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        let mut rows = self.rows.lock().await;
        match rows.get_mut(&id) {
            Some(row) if row.status == OutboxStatus::Sending => {
                row.status = OutboxStatus::Failed;
                row.last_error = Some(truncate_cause(cause));
                row.updated_at = now;
                row.next_retry_at = after(now, backoff);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_dead_lettered(
        &self,
        id: EventId,
        cause: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        let mut rows = self.rows.lock().await;
        match rows.get_mut(&id) {
            Some(row) if row.status == OutboxStatus::Sending => {
                row.status = OutboxStatus::DeadLettered;
                row.last_error = Some(truncate_cause(cause));
                row.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn status_counts(&self) -> Result<HashMap<OutboxStatus, i64>, OutboxStoreError> {
        let rows = self.rows.lock().await;
        let mut counts = HashMap::new();
        for row in rows.values() {
            *counts.entry(row.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
