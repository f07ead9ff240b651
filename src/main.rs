use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod idgen;
mod messaging;
mod metrics;
mod outbox;
mod relay;
mod utils;

use config::RelayConfig;
use idgen::{IdGenError, IdGenerator};
use kameo::prelude::*;
use messaging::{MessageSink, RedpandaSink, TopicResolver};
use outbox::{InMemoryOutboxStore, NewOutboxEvent, OutboxStore, PostgresOutboxStore};
use relay::{BatchPublisher, DeadLetterRouter, RelayActor, RelayLoop};
use utils::{retry_on_transient, RetryResult};

const DB_CONNECT_ATTEMPTS: u32 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with environment-based filtering
    // Default to INFO level, can be overridden with RUST_LOG env var
    // Example: RUST_LOG=debug outbox_relay --in-memory
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,outbox_relay=debug")),
        )
        .init();

    let config = RelayConfig::parse();
    config.validate()?;

    tracing::info!("🚀 Starting outbox relay");
    tracing::info!(
        partition = %config.partition()?,
        batch_size = config.batch_size,
        topic_prefix = %config.topic_prefix,
        dlq_topic = %config.dlq_topic,
        in_memory = config.in_memory,
        "Relay configuration loaded"
    );

    // === 1. Initialize Prometheus metrics ===
    let metrics = Arc::new(metrics::Metrics::new()?);
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    // Metrics HTTP server runs on its own actix system
    let metrics_registry = Arc::new(metrics.registry().clone());
    let metrics_port = config.metrics_port;
    std::thread::spawn(move || {
        actix_web::rt::System::new().block_on(async move {
            if let Err(e) = metrics::start_metrics_server(metrics_registry, metrics_port).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    });

    // === 2. Outbox store ===
    let store: Arc<dyn OutboxStore> = if config.in_memory {
        tracing::warn!("Using in-memory outbox store; nothing survives a restart");
        Arc::new(InMemoryOutboxStore::new())
    } else {
        Arc::new(connect_postgres(&config).await?)
    };

    // === 3. Optional demo traffic through the write path ===
    if config.demo_events > 0 {
        seed_demo_events(store.as_ref(), &config, &metrics).await?;
    }

    // === 4. Sink, publisher and dead-letter routing ===
    let sink: Arc<dyn MessageSink> = Arc::new(RedpandaSink::new(&config.brokers, config.publish_timeout())?);
    let publisher = BatchPublisher::new(
        sink.clone(),
        TopicResolver::new(config.topic_prefix.clone()),
        config.thread_pool_size,
        config.publish_timeout(),
    )
    .with_metrics(metrics.clone());
    let dead_letter = DeadLetterRouter::new(sink, config.dlq_topic.clone(), config.publish_timeout());

    // === 5. Relay actor drives the loop on a fixed delay ===
    let relay = RelayLoop::new(
        store,
        publisher,
        dead_letter,
        config.retry_policy(),
        config.relay_loop()?,
        metrics.clone(),
    );
    let relay_actor = RelayActor::spawn(RelayActor::new(relay));

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutdown requested, finishing the current tick");

    if relay_actor.stop_gracefully().await.is_err() {
        tracing::warn!("Relay actor already stopped");
    }
    for _ in 0..100 {
        if !relay_actor.is_alive() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    tracing::info!("👋 Outbox relay stopped");
    Ok(())
}

async fn connect_postgres(config: &RelayConfig) -> anyhow::Result<PostgresOutboxStore> {
    let url = config
        .database_url
        .clone()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is not set"))?;
    let max_connections = config.thread_pool_size as u32 + 2;

    tracing::info!("Connecting to Postgres...");
    let pool = match retry_on_transient(&config.retry_policy(), DB_CONNECT_ATTEMPTS, |attempt| {
        tracing::debug!(attempt = attempt, "Opening Postgres pool");
        PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&url)
    })
    .await
    {
        RetryResult::Success(pool) => pool,
        RetryResult::Failed(e) | RetryResult::PermanentFailure(e) => {
            return Err(anyhow::anyhow!("Failed to connect to Postgres: {}", e));
        }
    };

    let store = PostgresOutboxStore::new(pool);
    store.ensure_schema().await?;
    tracing::info!(instance_id = %store.instance_id(), "✅ Postgres outbox store ready");

    Ok(store)
}

async fn seed_demo_events(
    store: &dyn OutboxStore,
    config: &RelayConfig,
    metrics: &metrics::Metrics,
) -> anyhow::Result<()> {
    let ids = IdGenerator::new(config.id_generator())?;
    let aggregate_types = ["Order", "Customer", "Payment"];

    tracing::info!(count = config.demo_events, node_id = ids.node_id(), "📝 Seeding demo events");

    for n in 0..config.demo_events {
        let aggregate_type = aggregate_types[n as usize % aggregate_types.len()];
        let payload = serde_json::to_vec(&serde_json::json!({ "sequence": n, "source": "demo" }))?;

        let event = match NewOutboxEvent::with_generated_id(
            &ids,
            aggregate_type,
            uuid::Uuid::new_v4().to_string(),
            format!("{}Created", aggregate_type),
            payload,
        ) {
            Ok(event) => {
                metrics.record_id_generated();
                event.with_header("source", "outbox-relay-demo")
            }
            Err(e) => {
                if matches!(e, IdGenError::ClockRegression { .. }) {
                    metrics.record_clock_regression();
                }
                return Err(e.into());
            }
        };

        store.save(event).await?;
    }

    tracing::info!(count = config.demo_events, "✅ Demo events written to the outbox");
    Ok(())
}
