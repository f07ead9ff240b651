// ============================================================================
// Clock Source
// ============================================================================
//
// Wall-clock abstraction used by the id generator. Production code reads
// chrono's UTC clock; tests swap in deterministic clocks so that regression
// and sequence-exhaustion paths can be driven explicitly.
//
// ============================================================================

/// Millisecond wall clock
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}
