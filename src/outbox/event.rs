use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::idgen::{Clock, IdGenError, IdGenerator};

// ============================================================================
// Outbox Event Model
// ============================================================================
//
// Row shape of the outbox table and the explicit status mapping used by
// every store implementation.
//
// Status lifecycle:
//
//   PENDING ──claim──▶ SENDING ──▶ PUBLISHED   (terminal)
//                        │  ▲ ───▶ DEAD_LETTER (terminal)
//                        ▼  │
//                       FAILED ──claim (after next_retry_at)──┘
//
// A row left in SENDING longer than the stuck threshold is reclaimed as if
// its previous owner had crashed.
//
// ============================================================================

pub type EventId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutboxStatus {
    Pending,
    Sending,
    Published,
    Failed,
    DeadLettered,
}

impl OutboxStatus {
    pub const ALL: [OutboxStatus; 5] = [
        OutboxStatus::Pending,
        OutboxStatus::Sending,
        OutboxStatus::Published,
        OutboxStatus::Failed,
        OutboxStatus::DeadLettered,
    ];

    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Sending => "SENDING",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::Failed => "FAILED",
            OutboxStatus::DeadLettered => "DEAD_LETTER",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Published | OutboxStatus::DeadLettered)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown outbox status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for OutboxStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "SENDING" => Ok(OutboxStatus::Sending),
            "PUBLISHED" => Ok(OutboxStatus::Published),
            "FAILED" => Ok(OutboxStatus::Failed),
            "DEAD_LETTER" => Ok(OutboxStatus::DeadLettered),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Static ownership of the modulo-class `event_id % total == index`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    index: u32,
    total: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionError {
    #[error("Partition total must be at least 1")]
    ZeroTotal,

    #[error("Partition index {index} out of range for {total} partitions")]
    IndexOutOfRange { index: u32, total: u32 },
}

impl Partition {
    pub fn new(index: u32, total: u32) -> Result<Self, PartitionError> {
        if total == 0 {
            return Err(PartitionError::ZeroTotal);
        }
        if index >= total {
            return Err(PartitionError::IndexOutOfRange { index, total });
        }
        Ok(Self { index, total })
    }

    /// The whole key space
    pub fn whole() -> Self {
        Self { index: 0, total: 1 }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn is_whole(&self) -> bool {
        self.total == 1
    }

    pub fn owns(&self, event_id: EventId) -> bool {
        event_id.rem_euclid(self.total as i64) == self.index as i64
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.total)
    }
}

/// Envelope inserted by the application's write path
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub event_id: EventId,
    pub event_version: i32,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl NewOutboxEvent {
    pub fn new(
        event_id: EventId,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            event_id,
            event_version: 1,
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
            headers: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Build an event whose id is drawn from `ids`
    pub fn with_generated_id<C: Clock>(
        ids: &IdGenerator<C>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<Self, IdGenError> {
        Ok(Self::new(ids.next_id()?, aggregate_type, aggregate_id, event_type, payload))
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[cfg(test)]
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// A persisted outbox row
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEvent {
    pub event_id: EventId,
    pub event_version: i32,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub status: OutboxStatus,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_retry_at: DateTime<Utc>,
    pub claimed_by: Option<Uuid>,
}

impl OutboxEvent {
    /// Row as it looks right after `save`
    pub fn pending(event: NewOutboxEvent) -> Self {
        Self {
            event_id: event.event_id,
            event_version: event.event_version,
            aggregate_type: event.aggregate_type,
            aggregate_id: event.aggregate_id,
            event_type: event.event_type,
            payload: event.payload,
            headers: event.headers,
            status: OutboxStatus::Pending,
            attempt_count: 0,
            last_error: None,
            created_at: event.created_at,
            updated_at: event.created_at,
            next_retry_at: event.created_at,
            claimed_by: None,
        }
    }

    /// The claim predicate shared by every store
    pub fn is_claimable(&self, now: DateTime<Utc>, stuck_threshold: chrono::Duration) -> bool {
        match self.status {
            OutboxStatus::Pending | OutboxStatus::Failed => self.next_retry_at <= now,
            OutboxStatus::Sending => self.updated_at < now - stuck_threshold,
            OutboxStatus::Published | OutboxStatus::DeadLettered => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idgen::testing::ManualClock;
    use crate::idgen::{IdGeneratorConfig, SnowflakeParts, DEFAULT_CUSTOM_EPOCH_MS};
    use chrono::Duration;

    #[test]
    fn test_generated_ids_are_unique_and_ordered() {
        let config = IdGeneratorConfig {
            node_id: 12,
            ..IdGeneratorConfig::default()
        };
        let ids = IdGenerator::with_clock(config, ManualClock::new(DEFAULT_CUSTOM_EPOCH_MS + 5_000)).unwrap();

        let first = NewOutboxEvent::with_generated_id(&ids, "Order", "order-1", "OrderPlaced", b"{}".to_vec()).unwrap();
        let second = NewOutboxEvent::with_generated_id(&ids, "Order", "order-1", "OrderShipped", b"{}".to_vec()).unwrap();

        assert!(second.event_id > first.event_id);
        let parts = SnowflakeParts::decode(first.event_id);
        assert_eq!(parts.node_id, 12);
        assert_eq!(parts.timestamp_ms, 5_000);
        assert_eq!(first.aggregate_id, "order-1");
        assert_eq!(second.event_type, "OrderShipped");
    }

    #[test]
    fn test_status_mapping_table() {
        for status in OutboxStatus::ALL {
            let parsed: OutboxStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert_eq!(OutboxStatus::DeadLettered.as_str(), "DEAD_LETTER");
        assert!("SENT".parse::<OutboxStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(OutboxStatus::Published.is_terminal());
        assert!(OutboxStatus::DeadLettered.is_terminal());
        assert!(!OutboxStatus::Failed.is_terminal());
        assert!(!OutboxStatus::Sending.is_terminal());
    }

    #[test]
    fn test_partition_validation() {
        assert_eq!(Partition::new(0, 0), Err(PartitionError::ZeroTotal));
        assert_eq!(
            Partition::new(3, 3),
            Err(PartitionError::IndexOutOfRange { index: 3, total: 3 })
        );
        assert!(Partition::new(2, 3).is_ok());
        assert!(Partition::whole().is_whole());
    }

    #[test]
    fn test_partitions_cover_key_space_exactly_once() {
        let partitions: Vec<Partition> = (0..4).map(|i| Partition::new(i, 4).unwrap()).collect();
        for id in 0..1_000i64 {
            let owners = partitions.iter().filter(|p| p.owns(id)).count();
            assert_eq!(owners, 1, "id {} must have exactly one owner", id);
            assert!(Partition::whole().owns(id));
        }
    }

    #[test]
    fn test_claim_predicate() {
        let now = Utc::now();
        let stuck = Duration::seconds(60);
        let mut row = OutboxEvent::pending(NewOutboxEvent::new(1, "Order", "o-1", "OrderCreated", b"{}".to_vec()).with_created_at(now));
        assert!(row.is_claimable(now, stuck));

        row.status = OutboxStatus::Failed;
        row.next_retry_at = now + Duration::seconds(5);
        assert!(!row.is_claimable(now, stuck));
        assert!(row.is_claimable(now + Duration::seconds(5), stuck));

        row.status = OutboxStatus::Sending;
        row.updated_at = now;
        assert!(!row.is_claimable(now + Duration::seconds(60), stuck));
        assert!(row.is_claimable(now + Duration::seconds(61), stuck));

        row.status = OutboxStatus::Published;
        assert!(!row.is_claimable(now + Duration::days(365), stuck));
    }

    #[test]
    fn test_event_builder() {
        let payload = serde_json::to_vec(&serde_json::json!({"total": 10})).unwrap();
        let event = NewOutboxEvent::new(9, "Order", "o-9", "OrderCreated", payload)
            .with_header("trace-id", "abc");

        assert_eq!(event.event_version, 1);
        assert_eq!(event.headers.get("trace-id").map(String::as_str), Some("abc"));
        let value: serde_json::Value = serde_json::from_slice(&event.payload).unwrap();
        assert_eq!(value["total"], 10);
    }
}
