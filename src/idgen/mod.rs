// ============================================================================
// Id Generation
// ============================================================================
//
// Lock-free, time-ordered 64-bit identifiers used for outbox event ids and
// aggregate roots.
//
// ============================================================================

mod clock;
mod snowflake;

pub use clock::{Clock, SystemClock};
#[cfg(test)]
pub(crate) use clock::testing;
pub use snowflake::{
    IdGenError, IdGenerator, IdGeneratorConfig, SnowflakeParts, DEFAULT_CUSTOM_EPOCH_MS,
    MAX_NODE_ID,
};
