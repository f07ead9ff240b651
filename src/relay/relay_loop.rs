use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::metrics::Metrics;
use crate::outbox::{OutboxStore, OutboxStoreError, Partition};
use crate::relay::dead_letter::{DeadLetterOutcome, DeadLetterRouter};
use crate::relay::publisher::BatchPublisher;
use crate::utils::{Disposition, RetryPolicy};

// ============================================================================
// Relay Loop - one claim → publish → record cycle
// ============================================================================
//
//   claim_by_partition ──► process_batch ──► mark_published
//                                       └──► mark_failed_with_backoff
//                                       └──► dead-letter + mark_dead_lettered
//
// A tick never holds a database transaction across network I/O: the claim
// commits first, and the outcome is written back afterwards. If the process
// dies in between, the rows sit in SENDING until `stuck_threshold` elapses
// and another tick reclaims them.
//
// Outcomes are stamped with the wall clock at the moment they are written,
// so a retry backoff always counts from the failure, not from the claim.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Outbox store error: {0}")]
    Store(#[from] OutboxStoreError),
}

#[derive(Debug, Clone)]
pub struct RelayLoopConfig {
    pub partition: Partition,
    pub batch_size: usize,
    pub stuck_threshold: Duration,
    pub fixed_delay: Duration,
}

impl Default for RelayLoopConfig {
    fn default() -> Self {
        Self {
            partition: Partition::whole(),
            batch_size: 100,
            stuck_threshold: Duration::from_secs(600),
            fixed_delay: Duration::from_millis(1_000),
        }
    }
}

/// Counts for a single tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub published: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Rows whose outcome could not be recorded because they left SENDING
    pub skipped: usize,
}

impl TickReport {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.claimed == 0
    }

    pub fn outcome(&self) -> &'static str {
        if self.is_idle() {
            "idle"
        } else if self.retried == 0 && self.dead_lettered == 0 {
            "ok"
        } else {
            "partial"
        }
    }
}

/// Cumulative counters since the loop was created
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub ticks: u64,
    pub failed_ticks: u64,
    pub claimed: u64,
    pub published: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

impl RelayStats {
    fn absorb(&mut self, report: &TickReport) {
        self.claimed += report.claimed as u64;
        self.published += report.published as u64;
        self.retried += report.retried as u64;
        self.dead_lettered += report.dead_lettered as u64;
    }
}

pub struct RelayLoop {
    store: Arc<dyn OutboxStore>,
    publisher: BatchPublisher,
    dead_letter: DeadLetterRouter,
    policy: RetryPolicy,
    config: RelayLoopConfig,
    metrics: Arc<Metrics>,
    stats: RelayStats,
}

impl RelayLoop {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: BatchPublisher,
        dead_letter: DeadLetterRouter,
        policy: RetryPolicy,
        config: RelayLoopConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            publisher,
            dead_letter,
            policy,
            config,
            metrics,
            stats: RelayStats::default(),
        }
    }

    pub fn config(&self) -> &RelayLoopConfig {
        &self.config
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub async fn tick(&self) -> Result<TickReport, RelayError> {
        self.tick_at(Utc::now()).await
    }

    /// Claim as of `now`, then publish and record each outcome.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport, RelayError> {
        let rows = self
            .store
            .claim_by_partition(
                self.config.partition,
                self.config.batch_size,
                now,
                self.config.stuck_threshold,
            )
            .await?;

        if rows.is_empty() {
            return Ok(TickReport::idle());
        }

        let mut report = TickReport {
            claimed: rows.len(),
            ..TickReport::default()
        };

        tracing::debug!(
            partition = %self.config.partition,
            claimed = report.claimed,
            "Claimed outbox events"
        );

        let outcome = self.publisher.process_batch(rows, &self.policy).await;

        if !outcome.success_ids.is_empty() {
            let marked = self.store.mark_published(&outcome.success_ids, Utc::now()).await? as usize;
            if marked < outcome.success_ids.len() {
                tracing::warn!(
                    expected = outcome.success_ids.len(),
                    marked = marked,
                    "Some published events were no longer in SENDING"
                );
            }
            report.published = marked;
            report.skipped += outcome.success_ids.len() - marked;
        }

        for failed in &outcome.failed {
            self.metrics.record_publish_failure(failed.retryable);
            let attempt = failed.event.attempt_count;
            match self.policy.disposition(failed, attempt) {
                Disposition::RetryAfter(delay) => {
                    let marked = self
                        .store
                        .mark_failed_with_backoff(failed.event.event_id, &failed.error.to_string(), delay, Utc::now())
                        .await?;
                    if marked {
                        tracing::info!(
                            event_id = failed.event.event_id,
                            attempt = attempt,
                            retry_in_ms = delay.as_millis() as u64,
                            "Scheduled outbox event for retry"
                        );
                        report.retried += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
                Disposition::DeadLetter => {
                    let retry_delay = self.policy.backoff(attempt.max(1) as u32);
                    match self
                        .dead_letter
                        .route(self.store.as_ref(), failed, retry_delay)
                        .await?
                    {
                        DeadLetterOutcome::DeadLettered => report.dead_lettered += 1,
                        DeadLetterOutcome::Rescheduled => report.retried += 1,
                        DeadLetterOutcome::Skipped => report.skipped += 1,
                    }
                }
            }
        }

        tracing::info!(
            partition = %self.config.partition,
            claimed = report.claimed,
            published = report.published,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            "Relay tick complete"
        );

        Ok(report)
    }

    /// Run one tick, absorbing any error so the scheduler keeps going.
    pub async fn run_tick(&mut self) -> Option<TickReport> {
        let started = Instant::now();
        self.stats.ticks += 1;

        let result = match self.tick().await {
            Ok(report) => {
                self.metrics
                    .record_outcomes(report.claimed, report.published, report.dead_lettered);
                self.metrics
                    .record_tick(report.outcome(), started.elapsed().as_secs_f64());
                self.stats.absorb(&report);
                Some(report)
            }
            Err(e) => {
                tracing::error!(error = %e, partition = %self.config.partition, "❌ Relay tick failed");
                self.metrics.record_tick_error();
                self.stats.failed_ticks += 1;
                None
            }
        };

        match self.store.status_counts().await {
            Ok(counts) => self.metrics.update_outbox_rows(&counts),
            Err(e) => tracing::debug!(error = %e, "Could not refresh outbox row gauges"),
        }

        result
    }
}
