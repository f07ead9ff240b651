use clap::Parser;
use std::time::Duration;

use crate::idgen::{IdGeneratorConfig, DEFAULT_CUSTOM_EPOCH_MS, MAX_NODE_ID};
use crate::outbox::{Partition, PartitionError};
use crate::relay::RelayLoopConfig;
use crate::utils::RetryPolicy;

// ============================================================================
// Relay Configuration - command line flags with environment fallbacks
// ============================================================================

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--database-url (or DATABASE_URL) is required unless --in-memory is set")]
    MissingDatabaseUrl,

    #[error("Invalid partition: {0}")]
    Partition(#[from] PartitionError),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("--node-id {0} exceeds the maximum of 1023")]
    NodeIdOutOfRange(u16),

    #[error("--base-backoff-ms ({base_ms}) must not exceed --max-backoff-ms ({max_ms})")]
    BackoffRange { base_ms: u64, max_ms: u64 },

    #[error(
        "--stuck-threshold-seconds ({threshold_secs}) must exceed the worst-case tick time of {worst_case_secs}s"
    )]
    StuckThreshold { threshold_secs: u64, worst_case_secs: u64 },
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Transactional outbox relay", long_about = None)]
pub struct RelayConfig {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Kafka / Redpanda bootstrap servers
    #[arg(long, env = "OUTBOX_BROKERS", default_value = "127.0.0.1:9092")]
    pub brokers: String,

    /// Events are published to `{topic_prefix}.{aggregate_type}`
    #[arg(long, env = "OUTBOX_TOPIC_PREFIX", default_value = "outbox")]
    pub topic_prefix: String,

    #[arg(long, env = "OUTBOX_DLQ_TOPIC", default_value = "outbox.dead-letter")]
    pub dlq_topic: String,

    /// Maximum rows claimed per tick
    #[arg(long, env = "OUTBOX_BATCH_SIZE", default_value_t = 100)]
    pub batch_size: usize,

    /// Delay between the end of one tick and the start of the next
    #[arg(long, env = "OUTBOX_FIXED_DELAY_MS", default_value_t = 1_000)]
    pub fixed_delay_ms: u64,

    /// Publishes in flight at once
    #[arg(long, env = "OUTBOX_THREAD_POOL_SIZE", default_value_t = 8)]
    pub thread_pool_size: usize,

    /// Per-event publish timeout
    #[arg(long, env = "OUTBOX_TIMEOUT_SECONDS", default_value_t = 5)]
    pub timeout_seconds: u64,

    #[arg(long, env = "OUTBOX_BASE_BACKOFF_MS", default_value_t = 5_000)]
    pub base_backoff_ms: u64,

    #[arg(long, env = "OUTBOX_MAX_BACKOFF_MS", default_value_t = 300_000)]
    pub max_backoff_ms: u64,

    /// Attempts before an event is dead-lettered (0 = retry forever)
    #[arg(long, env = "OUTBOX_MAX_ATTEMPTS", default_value_t = 10)]
    pub max_attempts: u32,

    /// SENDING rows older than this are reclaimed. Must exceed the
    /// worst-case tick time, see `RelayConfig::worst_case_tick`.
    #[arg(long, env = "OUTBOX_STUCK_THRESHOLD_SECONDS", default_value_t = 600)]
    pub stuck_threshold_seconds: u64,

    #[arg(long, env = "OUTBOX_INSTANCE_ID", default_value_t = 0)]
    pub instance_id: u32,

    #[arg(long, env = "OUTBOX_TOTAL_INSTANCES", default_value_t = 1)]
    pub total_instances: u32,

    /// Snowflake node id, unique per writer process
    #[arg(long, env = "OUTBOX_NODE_ID", default_value_t = 0)]
    pub node_id: u16,

    #[arg(long, env = "OUTBOX_CUSTOM_EPOCH_MS", default_value_t = DEFAULT_CUSTOM_EPOCH_MS)]
    pub custom_epoch_ms: u64,

    /// Backward clock jumps up to this size are absorbed
    #[arg(long, env = "OUTBOX_MAX_CLOCK_BACKWARD_MS", default_value_t = 5)]
    pub max_clock_backward_ms: u64,

    #[arg(long, env = "OUTBOX_METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// Run against an in-process store instead of Postgres
    #[arg(long)]
    pub in_memory: bool,

    /// Seed this many demo events through the write path at startup
    #[arg(long, default_value_t = 0)]
    pub demo_events: u32,
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.in_memory && self.database_url.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::MissingDatabaseUrl);
        }

        self.partition()?;

        if self.batch_size == 0 {
            return Err(ConfigError::Zero("--batch-size"));
        }
        if self.thread_pool_size == 0 {
            return Err(ConfigError::Zero("--thread-pool-size"));
        }
        if self.timeout_seconds == 0 {
            return Err(ConfigError::Zero("--timeout-seconds"));
        }
        if self.stuck_threshold_seconds == 0 {
            return Err(ConfigError::Zero("--stuck-threshold-seconds"));
        }
        let worst_case_secs = self.worst_case_tick().as_secs();
        if self.stuck_threshold_seconds <= worst_case_secs {
            return Err(ConfigError::StuckThreshold {
                threshold_secs: self.stuck_threshold_seconds,
                worst_case_secs,
            });
        }
        if self.node_id > MAX_NODE_ID {
            return Err(ConfigError::NodeIdOutOfRange(self.node_id));
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::BackoffRange {
                base_ms: self.base_backoff_ms,
                max_ms: self.max_backoff_ms,
            });
        }

        Ok(())
    }

    pub fn partition(&self) -> Result<Partition, PartitionError> {
        Partition::new(self.instance_id, self.total_instances)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Longest a claimed row can stay in SENDING before its outcome is
    /// written: every chunk of the batch hits the publish timeout, then every
    /// row hits it again on the dead-letter topic, one at a time.
    pub fn worst_case_tick(&self) -> Duration {
        let batch = self.batch_size as u64;
        let chunks = batch.div_ceil(self.thread_pool_size.max(1) as u64);
        let timeout = self.timeout_seconds;
        Duration::from_secs(chunks.saturating_add(batch).saturating_mul(timeout))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            max_attempts: (self.max_attempts > 0).then_some(self.max_attempts),
        }
    }

    pub fn id_generator(&self) -> IdGeneratorConfig {
        IdGeneratorConfig {
            node_id: self.node_id,
            custom_epoch_ms: self.custom_epoch_ms,
            max_clock_backward_ms: self.max_clock_backward_ms,
        }
    }

    pub fn relay_loop(&self) -> Result<RelayLoopConfig, ConfigError> {
        Ok(RelayLoopConfig {
            partition: self.partition()?,
            batch_size: self.batch_size,
            stuck_threshold: Duration::from_secs(self.stuck_threshold_seconds),
            fixed_delay: Duration::from_millis(self.fixed_delay_ms),
        })
    }
}
