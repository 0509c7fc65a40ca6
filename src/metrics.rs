//! Prometheus metrics for the identity mapping cache.
//!
//! Every recording method swallows its own failures: a broken label set or
//! encoder error is logged and dropped, never returned to the cache.

use prometheus::core::Collector;
use prometheus::{Counter, CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry};
use std::sync::Arc;
use tracing::{debug, error};

/// All metrics for the mapping cache
pub struct Metrics {
    pub registry: Registry,

    // Staleness metrics
    pub staleness_detected_total: CounterVec,
    pub staleness_refreshed_total: CounterVec,
    pub refresh_duration_seconds: Histogram,

    // Fallback metrics
    pub fallback_total: CounterVec,

    // Source lookup metrics
    pub lookup_attempts_total: CounterVec,
    pub lookup_retries_total: Counter,
    pub refresh_in_flight: Gauge,

    // Store metrics
    pub mappings_total: Gauge,
    pub persist_failures_total: Counter,
}

impl Metrics {
    /// Create a new metrics registry with all metrics
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let staleness_detected_total = CounterVec::new(
            Opts::new(
                "idmap_staleness_detected_total",
                "Stale mappings detected, by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(staleness_detected_total.clone()))?;

        let staleness_refreshed_total = CounterVec::new(
            Opts::new(
                "idmap_staleness_refreshed_total",
                "Refresh attempts of stale mappings, by outcome",
            ),
            &["success"],
        )?;
        registry.register(Box::new(staleness_refreshed_total.clone()))?;

        let refresh_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "idmap_refresh_duration_seconds",
                "Wall time of one mapping refresh including retries",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        registry.register(Box::new(refresh_duration_seconds.clone()))?;

        let fallback_total = CounterVec::new(
            Opts::new(
                "idmap_fallback_total",
                "Fallback resolutions, by strategy and reason",
            ),
            &["strategy", "reason"],
        )?;
        registry.register(Box::new(fallback_total.clone()))?;

        let lookup_attempts_total = CounterVec::new(
            Opts::new(
                "idmap_lookup_attempts_total",
                "Individual source lookup attempts, by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(lookup_attempts_total.clone()))?;

        let lookup_retries_total = Counter::with_opts(Opts::new(
            "idmap_lookup_retries_total",
            "Source lookup retries after transient failures",
        ))?;
        registry.register(Box::new(lookup_retries_total.clone()))?;

        let refresh_in_flight = Gauge::with_opts(Opts::new(
            "idmap_refresh_in_flight",
            "Source lookups currently holding a concurrency slot",
        ))?;
        registry.register(Box::new(refresh_in_flight.clone()))?;

        let mappings_total = Gauge::with_opts(Opts::new(
            "idmap_mappings_total",
            "Number of mappings in the store",
        ))?;
        registry.register(Box::new(mappings_total.clone()))?;

        let persist_failures_total = Counter::with_opts(Opts::new(
            "idmap_persist_failures_total",
            "Snapshot writes that failed",
        ))?;
        registry.register(Box::new(persist_failures_total.clone()))?;

        Ok(Self {
            registry,
            staleness_detected_total,
            staleness_refreshed_total,
            refresh_duration_seconds,
            fallback_total,
            lookup_attempts_total,
            lookup_retries_total,
            refresh_in_flight,
            mappings_total,
            persist_failures_total,
        })
    }

    /// Record a stale mapping detection
    pub fn record_staleness(&self, reason: &str) {
        bump(&self.staleness_detected_total, &[reason]);
    }

    /// Record the end of a refresh of a stale mapping
    pub fn record_refresh(&self, success: bool, duration_secs: f64) {
        bump(
            &self.staleness_refreshed_total,
            &[if success { "true" } else { "false" }],
        );
        self.refresh_duration_seconds.observe(duration_secs);
    }

    /// Record a fallback resolution
    pub fn record_fallback(&self, strategy: &str, reason: &str) {
        bump(&self.fallback_total, &[strategy, reason]);
    }

    /// Record one source lookup attempt
    pub fn record_lookup_attempt(&self, outcome: &str) {
        bump(&self.lookup_attempts_total, &[outcome]);
    }

    pub fn record_retry(&self) {
        self.lookup_retries_total.inc();
    }

    pub fn record_persist_failure(&self) {
        self.persist_failures_total.inc();
    }

    pub fn set_in_flight(&self, active: usize) {
        self.refresh_in_flight.set(active as f64);
    }

    pub fn set_mappings(&self, count: usize) {
        self.mappings_total.set(count as f64);
    }

    pub fn staleness_count(&self, reason: &str) -> u64 {
        read(&self.staleness_detected_total, &[reason])
    }

    pub fn refreshed_count(&self, success: bool) -> u64 {
        read(
            &self.staleness_refreshed_total,
            &[if success { "true" } else { "false" }],
        )
    }

    pub fn fallback_count(&self, strategy: &str, reason: &str) -> u64 {
        read(&self.fallback_total, &[strategy, reason])
    }

    /// Total fallback resolutions across all labels
    pub fn fallback_events(&self) -> u64 {
        self.fallback_total
            .collect()
            .iter()
            .flat_map(|family| family.get_metric())
            .map(|m| m.get_counter().get_value() as u64)
            .sum()
    }

    /// Render metrics in Prometheus text format
    pub fn render(&self) -> String {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        match encoder.encode_to_string(&metric_families) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to encode metrics");
                String::new()
            }
        }
    }
}

fn bump(vec: &CounterVec, labels: &[&str]) {
    match vec.get_metric_with_label_values(labels) {
        Ok(counter) => counter.inc(),
        Err(e) => debug!(error = %e, labels = ?labels, "Dropping metric update"),
    }
}

fn read(vec: &CounterVec, labels: &[&str]) -> u64 {
    vec.get_metric_with_label_values(labels)
        .map(|c| c.get() as u64)
        .unwrap_or(0)
}

/// Shared metrics instance
pub type SharedMetrics = Arc<Metrics>;

/// Create a shared metrics instance
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(Metrics::new()?))
}
