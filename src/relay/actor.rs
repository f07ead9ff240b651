use kameo::actor::ActorRef;
use kameo::error::Infallible;
use kameo::message::{Context, Message};
use kameo::reply::{Reply, ReplyError};
use kameo::Actor;

use super::relay_loop::{RelayLoop, RelayStats, TickReport};

// ============================================================================
// Relay Actor - owns the RelayLoop and drives it on a fixed delay
// ============================================================================
//
// Responsibilities:
// - Serialize ticks (one active tick per process)
// - Schedule the next tick `fixed_delay` after the previous one finished
// - Expose cumulative relay counters
//
// The scheduler task asks the actor for each tick and waits for the reply,
// so a slow tick delays the next one instead of overlapping it. Once the
// actor stops, the next ask fails and the scheduler exits.
//
// ============================================================================

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug)]
pub struct RunTick;

#[derive(Debug)]
pub struct GetRelayStats;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickResult {
    Completed(TickReport),
    /// Tick aborted; the error was logged and counted
    Failed,
}

impl Reply for TickResult {
    type Ok = Self;
    type Error = Infallible;
    type Value = Self;

    fn to_result(self) -> Result<Self, Infallible> {
        Ok(self)
    }

    fn into_any_err(self) -> Option<Box<dyn ReplyError>> {
        None
    }

    fn into_value(self) -> Self::Value {
        self
    }
}

impl Reply for RelayStats {
    type Ok = Self;
    type Error = Infallible;
    type Value = Self;

    fn to_result(self) -> Result<Self, Infallible> {
        Ok(self)
    }

    fn into_any_err(self) -> Option<Box<dyn ReplyError>> {
        None
    }

    fn into_value(self) -> Self::Value {
        self
    }
}

// ============================================================================
// Relay Actor
// ============================================================================

pub struct RelayActor {
    relay: RelayLoop,
    autostart: bool,
}

impl RelayActor {
    pub fn new(relay: RelayLoop) -> Self {
        Self {
            relay,
            autostart: true,
        }
    }

    /// Actor that only ticks when sent `RunTick`
    pub fn manual(relay: RelayLoop) -> Self {
        Self {
            relay,
            autostart: false,
        }
    }
}

impl Actor for RelayActor {
    type Args = Self;
    type Error = Infallible;

    async fn on_start(state: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        let config = state.relay.config().clone();
        tracing::info!(
            partition = %config.partition,
            batch_size = config.batch_size,
            fixed_delay_ms = config.fixed_delay.as_millis() as u64,
            "🔄 RelayActor started"
        );

        if !state.autostart {
            return Ok(state);
        }

        let fixed_delay = config.fixed_delay;
        tokio::spawn(async move {
            loop {
                if actor_ref.ask(RunTick).await.is_err() {
                    tracing::info!("Relay scheduler stopping");
                    break;
                }
                tokio::time::sleep(fixed_delay).await;
            }
        });

        Ok(state)
    }
}

// ============================================================================
// Message Handlers
// ============================================================================

impl Message<RunTick> for RelayActor {
    type Reply = TickResult;

    async fn handle(&mut self, _msg: RunTick, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        match self.relay.run_tick().await {
            Some(report) => TickResult::Completed(report),
            None => TickResult::Failed,
        }
    }
}

impl Message<GetRelayStats> for RelayActor {
    type Reply = RelayStats;

    async fn handle(&mut self, _msg: GetRelayStats, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.relay.stats().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::TopicResolver;
    use crate::metrics::Metrics;
    use crate::outbox::{InMemoryOutboxStore, NewOutboxEvent, OutboxStatus, OutboxStore};
    use crate::relay::dead_letter::DeadLetterRouter;
    use crate::relay::publisher::testing::RecordingSink;
    use crate::relay::publisher::BatchPublisher;
    use crate::relay::relay_loop::RelayLoopConfig;
    use crate::utils::RetryPolicy;
    use kameo::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn relay_loop(store: Arc<InMemoryOutboxStore>, sink: Arc<RecordingSink>) -> RelayLoop {
        let publisher = BatchPublisher::new(sink.clone(), TopicResolver::new("outbox"), 4, Duration::from_secs(1));
        let dead_letter = DeadLetterRouter::new(sink, "outbox.dead-letter", Duration::from_secs(1));
        let config = RelayLoopConfig {
            fixed_delay: Duration::from_millis(10),
            ..RelayLoopConfig::default()
        };
        RelayLoop::new(
            store,
            publisher,
            dead_letter,
            RetryPolicy::default(),
            config,
            Arc::new(Metrics::new().unwrap()),
        )
    }

    async fn seed(store: &InMemoryOutboxStore, ids: std::ops::RangeInclusive<i64>) {
        for id in ids {
            store
                .save(NewOutboxEvent::new(id, "Order", format!("order-{}", id), "OrderPlaced", b"{}".to_vec()))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_run_tick_message() {
        let store = Arc::new(InMemoryOutboxStore::new());
        seed(&store, 1..=3).await;
        let sink = Arc::new(RecordingSink::default());
        let actor_ref = RelayActor::spawn(RelayActor::manual(relay_loop(store.clone(), sink)));

        let result = actor_ref.ask(RunTick).await.unwrap();
        match result {
            TickResult::Completed(report) => assert_eq!(report.published, 3),
            TickResult::Failed => panic!("tick should succeed"),
        }

        let stats = actor_ref.ask(GetRelayStats).await.unwrap();
        assert_eq!(stats.ticks, 1);
        assert_eq!(stats.published, 3);
    }

    #[tokio::test]
    async fn test_scheduler_drains_outbox() {
        let store = Arc::new(InMemoryOutboxStore::new());
        seed(&store, 1..=5).await;
        let sink = Arc::new(RecordingSink::default());
        let actor_ref = RelayActor::spawn(RelayActor::new(relay_loop(store.clone(), sink.clone())));

        let mut drained = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if sink.published.lock().unwrap().len() == 5 {
                drained = true;
                break;
            }
        }
        assert!(drained);

        // Queued behind any in-flight tick
        let stats = actor_ref.ask(GetRelayStats).await.unwrap();
        assert!(stats.ticks >= 1);
        assert_eq!(stats.published, 5);

        for id in 1..=5 {
            assert_eq!(store.get(id).await.unwrap().status, OutboxStatus::Published);
        }

        actor_ref.stop_gracefully().await.unwrap();
    }
}
