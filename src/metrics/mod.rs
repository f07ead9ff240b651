// Private module declaration
mod server;

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
};
use std::collections::HashMap;

use crate::outbox::OutboxStatus;

// Re-export for public API
pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for the relay
// ============================================================================
//
// Provides:
// - Per-tick outcome counts and duration
// - Claimed / published / failed / dead-lettered event counters
// - Per-item publish latency
// - Outbox table depth per status
// - Id generation volume and clock regressions
//
// All metrics are registered with Prometheus and can be scraped via /metrics
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Relay tick metrics
    pub relay_ticks: IntCounterVec,
    pub relay_tick_errors: IntCounter,
    pub relay_tick_duration: Histogram,

    // Event outcome metrics
    pub events_claimed: IntCounter,
    pub events_published: IntCounter,
    pub events_failed: IntCounterVec,
    pub events_dead_lettered: IntCounter,
    pub publish_duration: Histogram,

    // Outbox table depth
    pub outbox_rows: IntGaugeVec,

    // Id generation
    pub ids_generated: IntCounter,
    pub clock_regressions: IntCounter,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let relay_ticks = IntCounterVec::new(
            Opts::new("relay_ticks_total", "Relay ticks by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(relay_ticks.clone()))?;

        let relay_tick_errors = IntCounter::new(
            "relay_tick_errors_total",
            "Relay ticks aborted by an unexpected error",
        )?;
        registry.register(Box::new(relay_tick_errors.clone()))?;

        let relay_tick_duration = Histogram::with_opts(
            HistogramOpts::new("relay_tick_duration_seconds", "Wall time of one relay tick")
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;
        registry.register(Box::new(relay_tick_duration.clone()))?;

        let events_claimed = IntCounter::new(
            "relay_events_claimed_total",
            "Outbox events claimed by this relay",
        )?;
        registry.register(Box::new(events_claimed.clone()))?;

        let events_published = IntCounter::new(
            "relay_events_published_total",
            "Outbox events acknowledged by the sink",
        )?;
        registry.register(Box::new(events_published.clone()))?;

        let events_failed = IntCounterVec::new(
            Opts::new("relay_events_failed_total", "Outbox events that failed to publish"),
            &["retryable"],
        )?;
        registry.register(Box::new(events_failed.clone()))?;

        let events_dead_lettered = IntCounter::new(
            "relay_events_dead_lettered_total",
            "Outbox events moved to the dead-letter topic",
        )?;
        registry.register(Box::new(events_dead_lettered.clone()))?;

        let publish_duration = Histogram::with_opts(
            HistogramOpts::new("relay_publish_duration_seconds", "Per-event publish latency")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(publish_duration.clone()))?;

        let outbox_rows = IntGaugeVec::new(
            Opts::new("outbox_rows", "Rows in the outbox table by status"),
            &["status"],
        )?;
        registry.register(Box::new(outbox_rows.clone()))?;

        let ids_generated = IntCounter::new(
            "idgen_ids_generated_total",
            "Snowflake ids issued by this process",
        )?;
        registry.register(Box::new(ids_generated.clone()))?;

        let clock_regressions = IntCounter::new(
            "idgen_clock_regressions_total",
            "Id generation refused because the clock moved backwards",
        )?;
        registry.register(Box::new(clock_regressions.clone()))?;

        Ok(Self {
            registry,
            relay_ticks,
            relay_tick_errors,
            relay_tick_duration,
            events_claimed,
            events_published,
            events_failed,
            events_dead_lettered,
            publish_duration,
            outbox_rows,
            ids_generated,
            clock_regressions,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Helper to record one tick
    pub fn record_tick(&self, outcome: &str, duration_secs: f64) {
        self.relay_ticks.with_label_values(&[outcome]).inc();
        self.relay_tick_duration.observe(duration_secs);
    }

    pub fn record_tick_error(&self) {
        self.relay_tick_errors.inc();
        self.relay_ticks.with_label_values(&["error"]).inc();
    }

    /// Helper to record the per-event results of a tick
    pub fn record_outcomes(&self, claimed: usize, published: usize, dead_lettered: usize) {
        self.events_claimed.inc_by(claimed as u64);
        self.events_published.inc_by(published as u64);
        self.events_dead_lettered.inc_by(dead_lettered as u64);
    }

    pub fn record_publish_failure(&self, retryable: bool) {
        let label = if retryable { "true" } else { "false" };
        self.events_failed.with_label_values(&[label]).inc();
    }

    pub fn observe_publish(&self, duration_secs: f64) {
        self.publish_duration.observe(duration_secs);
    }

    /// Helper to refresh the per-status gauges. Statuses missing from
    /// `counts` are reported as zero.
    pub fn update_outbox_rows(&self, counts: &HashMap<OutboxStatus, i64>) {
        for status in OutboxStatus::ALL {
            let count = counts.get(&status).copied().unwrap_or(0);
            self.outbox_rows.with_label_values(&[status.as_str()]).set(count);
        }
    }

    pub fn record_id_generated(&self) {
        self.ids_generated.inc();
    }

    pub fn record_clock_regression(&self) {
        self.clock_regressions.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_value(metrics: &Metrics, name: &str) -> f64 {
        let gathered = metrics.registry.gather();
        let family = gathered.iter().find(|m| m.name() == name).unwrap();
        family.metric[0].counter.value.unwrap_or(0.0)
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert!(metrics.registry.gather().len() > 0);
    }

    #[test]
    fn test_record_outcomes() {
        let metrics = Metrics::new().unwrap();
        metrics.record_outcomes(10, 7, 1);
        metrics.record_publish_failure(true);
        metrics.record_publish_failure(true);
        metrics.record_publish_failure(false);

        assert_eq!(counter_value(&metrics, "relay_events_claimed_total"), 10.0);
        assert_eq!(counter_value(&metrics, "relay_events_published_total"), 7.0);
        assert_eq!(counter_value(&metrics, "relay_events_dead_lettered_total"), 1.0);

        let gathered = metrics.registry.gather();
        let failed = gathered.iter().find(|m| m.name() == "relay_events_failed_total").unwrap();
        assert_eq!(failed.metric.len(), 2); // retryable=true and retryable=false
        assert_eq!(metrics.events_failed.with_label_values(&["true"]).get(), 2);
    }

    #[test]
    fn test_record_tick_error() {
        let metrics = Metrics::new().unwrap();
        metrics.record_tick("idle", 0.001);
        metrics.record_tick_error();

        assert_eq!(counter_value(&metrics, "relay_tick_errors_total"), 1.0);
        let gathered = metrics.registry.gather();
        let ticks = gathered.iter().find(|m| m.name() == "relay_ticks_total").unwrap();
        assert_eq!(ticks.metric.len(), 2); // idle and error
    }

    #[test]
    fn test_outbox_row_gauges() {
        let metrics = Metrics::new().unwrap();
        let counts = HashMap::from([(OutboxStatus::Pending, 4), (OutboxStatus::Failed, 1)]);
        metrics.update_outbox_rows(&counts);

        assert_eq!(metrics.outbox_rows.with_label_values(&["PENDING"]).get(), 4);
        assert_eq!(metrics.outbox_rows.with_label_values(&["FAILED"]).get(), 1);
        assert_eq!(metrics.outbox_rows.with_label_values(&["PUBLISHED"]).get(), 0);
    }

    #[test]
    fn test_idgen_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.record_id_generated();
        metrics.record_id_generated();
        metrics.record_clock_regression();

        assert_eq!(counter_value(&metrics, "idgen_ids_generated_total"), 2.0);
        assert_eq!(counter_value(&metrics, "idgen_clock_regressions_total"), 1.0);
    }
}
