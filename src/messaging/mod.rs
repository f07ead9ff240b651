// Private module declarations
mod envelope;
mod redpanda;
mod sink;

// Re-export for public API
pub use envelope::{DeadLetterEnvelope, InvalidTopic, TopicResolver, WireEnvelope};
pub use redpanda::RedpandaSink;
pub use sink::{MessageSink, SinkError};
