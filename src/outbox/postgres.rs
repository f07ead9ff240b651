use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, Row, Transaction};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use super::event::{EventId, NewOutboxEvent, OutboxEvent, OutboxStatus, Partition};
use super::store::{after, before, truncate_cause, OutboxStore, OutboxStoreError};

// ============================================================================
// PostgreSQL Outbox Store
// ============================================================================
//
// Claims use a single CTE: the inner SELECT picks claimable rows with
// `FOR UPDATE SKIP LOCKED`, the outer UPDATE moves them to SENDING. Rows
// another relay is busy with are skipped instead of waited on, so claimers
// never block each other and never get the same row.
//
// Partitioned claims add `mod(event_id, total) = index`; with static
// assignment every relay instance scans a disjoint modulo-class and the
// SKIP LOCKED path is effectively uncontended.
//
// The claim commits before rows are decoded. A row that cannot be decoded
// is parked in DEAD_LETTER on its own so the rest of the batch still goes
// out and the bad row is not reclaimed forever.
//
// ============================================================================

const CLAIM_SQL: &str = r#"
    WITH claimable AS (
        SELECT event_id
        FROM outbox_events
        WHERE (
                (status IN ('PENDING', 'FAILED') AND next_retry_at <= $1)
             OR (status = 'SENDING' AND updated_at < $2)
              )
          AND ($3 = 1 OR mod(event_id, $3) = $4)
        ORDER BY created_at ASC
        LIMIT $5
        FOR UPDATE SKIP LOCKED
    )
    UPDATE outbox_events AS e
    SET status = 'SENDING',
        attempt_count = e.attempt_count + 1,
        updated_at = $1,
        claimed_by = $6
    FROM claimable
    WHERE e.event_id = claimable.event_id
    RETURNING e.event_id, e.event_version, e.aggregate_type, e.aggregate_id, e.event_type,
              e.payload, e.headers, e.attempt_count, e.last_error,
              e.created_at, e.updated_at, e.next_retry_at, e.claimed_by
"#;

/// A row as returned by the claim, always in SENDING
#[derive(FromRow)]
struct ClaimedRow {
    event_id: i64,
    event_version: i32,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    payload: Vec<u8>,
    headers: Json<serde_json::Value>,
    attempt_count: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    next_retry_at: DateTime<Utc>,
    claimed_by: Option<Uuid>,
}

impl From<ClaimedRow> for OutboxEvent {
    fn from(row: ClaimedRow) -> Self {
        OutboxEvent {
            headers: headers_from_json(row.event_id, row.headers.0),
            event_id: row.event_id,
            event_version: row.event_version,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            payload: row.payload,
            status: OutboxStatus::Sending,
            attempt_count: row.attempt_count,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            next_retry_at: row.next_retry_at,
            claimed_by: row.claimed_by,
        }
    }
}

/// Headers written by other producers may carry non-string values; those
/// are kept in their JSON text form. Anything but an object is dropped.
fn headers_from_json(event_id: EventId, value: serde_json::Value) -> HashMap<String, String> {
    match value {
        serde_json::Value::Object(map) => map
            .into_iter()
            .map(|(key, value)| match value {
                serde_json::Value::String(s) => (key, s),
                other => (key, other.to_string()),
            })
            .collect(),
        serde_json::Value::Null => HashMap::new(),
        other => {
            tracing::warn!(event_id = event_id, headers = %other, "Ignoring non-object outbox headers");
            HashMap::new()
        }
    }
}

pub struct PostgresOutboxStore {
    pool: PgPool,
    /// Written to `claimed_by` on every claim
    instance_id: Uuid,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            instance_id: Uuid::now_v7(),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Create the outbox table and its claim index if they don't exist
    pub async fn ensure_schema(&self) -> Result<(), OutboxStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_events (
                event_id BIGINT PRIMARY KEY,
                event_version INTEGER NOT NULL DEFAULT 1,
                aggregate_type TEXT NOT NULL,
                aggregate_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload BYTEA NOT NULL,
                headers JSONB NOT NULL DEFAULT '{}'::jsonb,
                status TEXT NOT NULL DEFAULT 'PENDING'
                    CHECK (status IN ('PENDING', 'SENDING', 'PUBLISHED', 'FAILED', 'DEAD_LETTER')),
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                next_retry_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                claimed_by UUID
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_outbox_events_claim
            ON outbox_events (status, next_retry_at, created_at)
            WHERE status IN ('PENDING', 'SENDING', 'FAILED')
            "#,
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("Outbox schema ready");
        Ok(())
    }

    /// Application write path: insert the event inside the caller's own
    /// business transaction so that both commit or neither does.
    pub async fn save_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        event: &NewOutboxEvent,
    ) -> Result<bool, OutboxStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO outbox_events (
                event_id, event_version, aggregate_type, aggregate_id, event_type,
                payload, headers, status, attempt_count, created_at, updated_at, next_retry_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, 'PENDING', 0, $8, $8, $8)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event.event_id)
        .bind(event.event_version)
        .bind(&event.aggregate_type)
        .bind(&event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(Json(&event.headers))
        .bind(event.created_at)
        .execute(&mut **tx)
        .await?;

        let inserted = result.rows_affected() == 1;
        if !inserted {
            tracing::debug!(event_id = event.event_id, "Duplicate outbox event ignored");
        }
        Ok(inserted)
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn save(&self, event: NewOutboxEvent) -> Result<bool, OutboxStoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = Self::save_in_tx(&mut tx, &event).await?;
        tx.commit().await?;
        Ok(inserted)
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

        let rows: Vec<PgRow> = sqlx::query(CLAIM_SQL)
            .bind(now)
            .bind(before(now, stuck_threshold))
            .bind(partition.total() as i64)
            .bind(partition.index() as i64)
            .bind(limit.min(i64::MAX as usize) as i64)
            .bind(self.instance_id)
            .fetch_all(&self.pool)
            .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            match ClaimedRow::from_row(row) {
                Ok(claimed) => events.push(OutboxEvent::from(claimed)),
                Err(e) => {
                    let event_id: EventId = row.try_get("event_id")?;
                    tracing::error!(event_id = event_id, error = %e, "☠️ Undecodable outbox row, parking in DEAD_LETTER");
                    self.mark_dead_lettered(event_id, &format!("undecodable outbox row: {}", e), now)
                        .await?;
                }
            }
        }
        // RETURNING does not preserve the CTE ordering
        events.sort_by_key(|e| (e.created_at, e.event_id));

        if !events.is_empty() {
            tracing::debug!(
                partition = %partition,
                claimed = events.len(),
                "Claimed outbox events"
            );
        }

        Ok(events)
    }

    async fn mark_published(
        &self,
        ids: &[EventId],
        now: DateTime<Utc>,
    ) -> Result<u64, OutboxStoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'PUBLISHED', updated_at = $2, last_error = NULL
            WHERE event_id = ANY($1) AND status = 'SENDING'
            "#,
        )
        .bind(ids)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn mark_failed_with_backoff(
        &self,
        id: EventId,
        cause: &str,
        backoff: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'FAILED', last_error = $2, updated_at = $3, next_retry_at = $4
            WHERE event_id = $1 AND status = 'SENDING'
            "#,
        )
        .bind(id)
        .bind(truncate_cause(cause))
        .bind(now)
        .bind(after(now, backoff))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_dead_lettered(
        &self,
        id: EventId,
        cause: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'DEAD_LETTER', last_error = $2, updated_at = $3
            WHERE event_id = $1 AND status = 'SENDING'
            "#,
        )
        .bind(id)
        .bind(truncate_cause(cause))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn status_counts(&self) -> Result<HashMap<OutboxStatus, i64>, OutboxStoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM outbox_events GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = HashMap::with_capacity(rows.len());
        for (status, count) in rows {
            match status.parse::<OutboxStatus>() {
                Ok(status) => {
                    counts.insert(status, count);
                }
                Err(e) => tracing::warn!(error = %e, "Skipping unknown status in outbox table"),
            }
        }
        Ok(counts)
    }
}
