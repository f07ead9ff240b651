pub mod actor;
pub mod dead_letter;
pub mod publisher;
pub mod relay_loop;

pub use actor::{GetRelayStats, RelayActor, RunTick, TickResult};
pub use dead_letter::{DeadLetterOutcome, DeadLetterRouter};
pub use publisher::{BatchOutcome, BatchPublisher, FailedEvent, PublishError};
pub use relay_loop::{RelayError, RelayLoop, RelayLoopConfig, RelayStats, TickReport};
