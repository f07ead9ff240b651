use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

use super::event::{EventId, NewOutboxEvent, OutboxEvent, OutboxStatus, Partition};

// ============================================================================
// Outbox Store - claim/mark protocol over the outbox table
// ============================================================================
//
// All cross-process synchronization happens here. A claim atomically moves
// the selected rows to SENDING so that no two claimers ever hold the same
// row, and every mark operation only touches rows that are still SENDING.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum OutboxStoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a PENDING row. Returns `false` when the event id already exists.
    async fn save(&self, event: NewOutboxEvent) -> Result<bool, OutboxStoreError>;

    /// Competitive claim over the whole key space
    async fn claim(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        stuck_threshold: Duration,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        self.claim_by_partition(Partition::whole(), limit, now, stuck_threshold)
            .await
    }

    /// Claim up to `limit` claimable rows owned by `partition`, oldest first.
    /// Claimed rows come back in SENDING with `attempt_count` already bumped.
    async fn claim_by_partition(
        &self,
        partition: Partition,
        limit: usize,
        now: DateTime<Utc>,
        stuck_threshold: Duration,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError>;

    /// SENDING -> PUBLISHED for `ids`. Returns the number of rows changed.
    async fn mark_published(
        &self,
        ids: &[EventId],
        now: DateTime<Utc>,
    ) -> Result<u64, OutboxStoreError>;

    /// SENDING -> FAILED, claimable again at `now + backoff`
    async fn mark_failed_with_backoff(
        &self,
        id: EventId,
        cause: &str,
        backoff: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError>;

    /// SENDING -> DEAD_LETTER
    async fn mark_dead_lettered(
        &self,
        id: EventId,
        cause: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError>;

    /// Row count per status
    async fn status_counts(&self) -> Result<HashMap<OutboxStatus, i64>, OutboxStoreError>;
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

/// `now + duration`, saturating instead of panicking on overflow
pub(crate) fn after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    now.checked_add_signed(to_chrono(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - duration`, saturating instead of panicking on underflow
pub(crate) fn before(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(to_chrono(duration))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Error text stored in `last_error` is bounded
pub(crate) fn truncate_cause(cause: &str) -> String {
    const MAX_ERROR_LEN: usize = 2_000;
    if cause.len() <= MAX_ERROR_LEN {
        return cause.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !cause.is_char_boundary(end) {
        end -= 1;
    }
    cause[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_helpers_saturate() {
        let now = Utc::now();
        assert_eq!(after(now, Duration::from_secs(5)), now + chrono::Duration::seconds(5));
        assert_eq!(before(now, Duration::from_secs(5)), now - chrono::Duration::seconds(5));
        assert_eq!(after(DateTime::<Utc>::MAX_UTC, Duration::from_secs(1)), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_truncate_cause_respects_char_boundaries() {
        let long = "é".repeat(1_500);
        let truncated = truncate_cause(&long);
        assert!(truncated.len() <= 2_000);
        assert!(truncated.chars().all(|c| c == 'é'));
        assert_eq!(truncate_cause("short"), "short");
    }
}
