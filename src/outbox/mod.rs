// ============================================================================
// Transactional Outbox
// ============================================================================
//
// Persisted queue of event envelopes with an explicit status lifecycle and
// the claim/mark protocol the relay drives.
//
// - event     - row model, status mapping, static partitions
// - store     - OutboxStore trait and shared helpers
// - postgres  - sqlx implementation (FOR UPDATE SKIP LOCKED)
// - memory    - in-process implementation
//
// ============================================================================

mod event;
mod memory;
mod postgres;
mod store;

pub use event::{
    EventId, NewOutboxEvent, OutboxEvent, OutboxStatus, Partition, PartitionError,
};
pub use memory::InMemoryOutboxStore;
pub use postgres::PostgresOutboxStore;
pub use store::{OutboxStore, OutboxStoreError};
