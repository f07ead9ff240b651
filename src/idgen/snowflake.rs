use std::sync::atomic::{AtomicU64, Ordering};

use super::clock::{Clock, SystemClock};

// ============================================================================
// Snowflake Id Generator
// ============================================================================
//
// 64-bit ids laid out as:
//
//   [ 1 unused ][ 41-bit ms since custom epoch ][ 10-bit node ][ 12-bit seq ]
//
// The generator keeps `(last_timestamp, sequence)` packed into a single
// AtomicU64 and advances it with compare-and-swap only. Contention between
// callers is resolved by retrying the CAS, never by parking a thread.
//
// ============================================================================

pub const TIMESTAMP_BITS: u32 = 41;
pub const NODE_ID_BITS: u32 = 10;
pub const SEQUENCE_BITS: u32 = 12;

pub const MAX_NODE_ID: u16 = (1 << NODE_ID_BITS) - 1;
pub const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;
const MAX_RELATIVE_TIMESTAMP: u64 = (1 << TIMESTAMP_BITS) - 1;

const NODE_SHIFT: u32 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + NODE_ID_BITS;

/// 2024-01-01T00:00:00Z
pub const DEFAULT_CUSTOM_EPOCH_MS: u64 = 1_704_067_200_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdGenError {
    #[error("Clock moved backwards by {backward_ms}ms (last={last_ms}, now={now_ms}, tolerance={tolerance_ms}ms)")]
    ClockRegression {
        last_ms: u64,
        now_ms: u64,
        backward_ms: u64,
        tolerance_ms: u64,
    },

    #[error("Node id {0} exceeds the 10-bit maximum of 1023")]
    InvalidNodeId(u16),

    #[error("Clock reading {now_ms} is before the custom epoch {epoch_ms}")]
    ClockBeforeEpoch { now_ms: u64, epoch_ms: u64 },

    #[error("Timestamp {0}ms past the custom epoch no longer fits in 41 bits")]
    TimestampOverflow(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct IdGeneratorConfig {
    pub node_id: u16,
    pub custom_epoch_ms: u64,
    pub max_clock_backward_ms: u64,
}

impl Default for IdGeneratorConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            custom_epoch_ms: DEFAULT_CUSTOM_EPOCH_MS,
            max_clock_backward_ms: 5,
        }
    }
}

/// Components of a generated id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnowflakeParts {
    /// Milliseconds since the custom epoch
    pub timestamp_ms: u64,
    pub node_id: u16,
    pub sequence: u16,
}

impl SnowflakeParts {
    pub fn decode(id: i64) -> Self {
        let raw = id as u64;
        Self {
            timestamp_ms: raw >> TIMESTAMP_SHIFT,
            node_id: ((raw >> NODE_SHIFT) & MAX_NODE_ID as u64) as u16,
            sequence: (raw & MAX_SEQUENCE) as u16,
        }
    }

    /// Wall-clock milliseconds since the Unix epoch
    pub fn unix_millis(&self, custom_epoch_ms: u64) -> u64 {
        custom_epoch_ms + self.timestamp_ms
    }
}

pub struct IdGenerator<C: Clock = SystemClock> {
    node_id: u64,
    custom_epoch_ms: u64,
    max_clock_backward_ms: u64,
    /// `(relative_timestamp << SEQUENCE_BITS) | sequence`
    state: AtomicU64,
    clock: C,
}

impl IdGenerator<SystemClock> {
    pub fn new(config: IdGeneratorConfig) -> Result<Self, IdGenError> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> IdGenerator<C> {
    pub fn with_clock(config: IdGeneratorConfig, clock: C) -> Result<Self, IdGenError> {
        if config.node_id > MAX_NODE_ID {
            return Err(IdGenError::InvalidNodeId(config.node_id));
        }

        Ok(Self {
            node_id: config.node_id as u64,
            custom_epoch_ms: config.custom_epoch_ms,
            max_clock_backward_ms: config.max_clock_backward_ms,
            state: AtomicU64::new(0),
            clock,
        })
    }

    pub fn node_id(&self) -> u16 {
        self.node_id as u16
    }

    /// Generate the next id.
    ///
    /// A clock regression larger than `max_clock_backward_ms` is returned as
    /// `IdGenError::ClockRegression` and is not retried here; the clock has to
    /// be fixed by an operator before ids can be issued again.
    pub fn next_id(&self) -> Result<i64, IdGenError> {
        loop {
            let observed = self.state.load(Ordering::Acquire);
            let last_ts = observed >> SEQUENCE_BITS;
            let last_seq = observed & MAX_SEQUENCE;

            let mut now = self.relative_now()?;
            if now < last_ts {
                self.check_regression(last_ts, now)?;
                now = last_ts;
            }

            let (timestamp, sequence) = if now == last_ts {
                if last_seq == MAX_SEQUENCE {
                    (self.wait_next_millis(last_ts)?, 0)
                } else {
                    (now, last_seq + 1)
                }
            } else {
                (now, 0)
            };

            if timestamp > MAX_RELATIVE_TIMESTAMP {
                return Err(IdGenError::TimestampOverflow(timestamp));
            }

            let next = (timestamp << SEQUENCE_BITS) | sequence;
            if self
                .state
                .compare_exchange(observed, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(self.compose(timestamp, sequence));
            }

            std::hint::spin_loop();
        }
    }

    fn compose(&self, timestamp: u64, sequence: u64) -> i64 {
        ((timestamp << TIMESTAMP_SHIFT) | (self.node_id << NODE_SHIFT) | sequence) as i64
    }

    fn relative_now(&self) -> Result<u64, IdGenError> {
        let now_ms = self.clock.now_millis();
        now_ms
            .checked_sub(self.custom_epoch_ms)
            .ok_or(IdGenError::ClockBeforeEpoch {
                now_ms,
                epoch_ms: self.custom_epoch_ms,
            })
    }

    fn check_regression(&self, last_ts: u64, now: u64) -> Result<(), IdGenError> {
        let backward_ms = last_ts - now;
        if backward_ms > self.max_clock_backward_ms {
            tracing::error!(
                node_id = self.node_id,
                backward_ms = backward_ms,
                tolerance_ms = self.max_clock_backward_ms,
                "🕰️ Clock regression beyond tolerance, refusing to issue ids"
            );
            return Err(IdGenError::ClockRegression {
                last_ms: last_ts + self.custom_epoch_ms,
                now_ms: now + self.custom_epoch_ms,
                backward_ms,
                tolerance_ms: self.max_clock_backward_ms,
            });
        }

        tracing::debug!(backward_ms = backward_ms, "Clock regression within tolerance, clamping");
        Ok(())
    }

    /// Spin until the clock moves past `last_ts`. Sequence exhaustion lasts at
    /// most the remainder of the current millisecond, so no sleep is involved.
    fn wait_next_millis(&self, last_ts: u64) -> Result<u64, IdGenError> {
        loop {
            let now = self.relative_now()?;
            if now > last_ts {
                return Ok(now);
            }
            if now < last_ts {
                self.check_regression(last_ts, now)?;
            }
            std::hint::spin_loop();
        }
    }
}
