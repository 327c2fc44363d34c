use anyhow::Result;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

const NAMESPACE: &str = "fleetsync";

/// Prometheus metrics for the collector.
///
/// All metrics use the "fleetsync" namespace and live in a private
/// registry, so several instances can coexist in one process (tests).
pub struct HealthMetrics {
    registry: Registry,

    // === Ingestion ===
    /// Samples accepted by the ingestion endpoint.
    pub samples_received: Counter,
    /// Samples with no datapoint destination.
    pub samples_unmonitored: Counter,
    /// Events accepted by the ingestion endpoint.
    pub events_received: Counter,
    /// Events translated into at least one delta record.
    pub events_mapped: Counter,
    /// Requests rejected by reason.
    pub ingest_rejected: CounterVec,

    // === Consolidation ===
    /// Delta records appended to a consolidation queue.
    pub deltas_appended: Counter,
    /// Delta records released by drains, by group.
    pub deltas_released: CounterVec,
    /// Delta records dropped by drains, by reason.
    pub deltas_suppressed: CounterVec,
    /// Records rejected before reaching a queue.
    pub deltas_rejected: Counter,
    /// Records currently held per target system.
    pub datamap_held: GaugeVec,
    /// Blacklisted entity ids per target system.
    pub blacklisted: GaugeVec,
    /// Sub-resources discovered from telemetry.
    pub discoveries: Counter,
    /// Target systems with pipeline state.
    pub target_systems: Gauge,

    // === Delivery ===
    /// Items waiting in the metric and event queues.
    pub queue_depth: GaugeVec,
    /// Metric writes delivered to the metric sink.
    pub metric_writes: Counter,
    /// Events delivered to the event sink.
    pub events_sent: Counter,
    /// Model batches applied.
    pub model_batches: Counter,

    // === Scheduler ===
    /// Scheduler task cycles by task.
    pub task_runs: CounterVec,
    /// Scheduler task cycles that failed, by task.
    pub task_errors: CounterVec,
    /// Scheduler task cycle duration by task.
    pub task_duration: HistogramVec,
}

impl HealthMetrics {
    /// Creates a new metrics instance with all metrics registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let samples_received = Counter::with_opts(
            Opts::new("samples_received_total", "Total telemetry samples received.")
                .namespace(NAMESPACE),
        )?;
        let samples_unmonitored = Counter::with_opts(
            Opts::new(
                "samples_unmonitored_total",
                "Total samples with no configured datapoint.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_received = Counter::with_opts(
            Opts::new("events_received_total", "Total control-plane events received.")
                .namespace(NAMESPACE),
        )?;
        let events_mapped = Counter::with_opts(
            Opts::new(
                "events_mapped_total",
                "Total events translated into model changes.",
            )
            .namespace(NAMESPACE),
        )?;
        let ingest_rejected = CounterVec::new(
            Opts::new(
                "ingest_rejected_total",
                "Total ingestion requests rejected by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;

        let deltas_appended = Counter::with_opts(
            Opts::new("deltas_appended_total", "Total delta records appended.")
                .namespace(NAMESPACE),
        )?;
        let deltas_released = CounterVec::new(
            Opts::new(
                "deltas_released_total",
                "Total delta records released by group.",
            )
            .namespace(NAMESPACE),
            &["group"],
        )?;
        let deltas_suppressed = CounterVec::new(
            Opts::new(
                "deltas_suppressed_total",
                "Total delta records dropped at drain by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let deltas_rejected = Counter::with_opts(
            Opts::new(
                "deltas_rejected_total",
                "Total delta records rejected before queueing.",
            )
            .namespace(NAMESPACE),
        )?;
        let datamap_held = GaugeVec::new(
            Opts::new("datamap_held", "Delta records held per target system.")
                .namespace(NAMESPACE),
            &["target"],
        )?;
        let blacklisted = GaugeVec::new(
            Opts::new("blacklisted", "Blacklisted entity ids per target system.")
                .namespace(NAMESPACE),
            &["target"],
        )?;
        let discoveries = Counter::with_opts(
            Opts::new("discoveries_total", "Total sub-resources discovered.").namespace(NAMESPACE),
        )?;
        let target_systems = Gauge::with_opts(
            Opts::new("target_systems", "Target systems with pipeline state.")
                .namespace(NAMESPACE),
        )?;

        let queue_depth = GaugeVec::new(
            Opts::new("queue_depth", "Items waiting for delivery by queue.").namespace(NAMESPACE),
            &["queue"],
        )?;
        let metric_writes = Counter::with_opts(
            Opts::new("metric_writes_total", "Total metric writes delivered.")
                .namespace(NAMESPACE),
        )?;
        let events_sent = Counter::with_opts(
            Opts::new("events_sent_total", "Total events delivered.").namespace(NAMESPACE),
        )?;
        let model_batches = Counter::with_opts(
            Opts::new("model_batches_total", "Total model batches applied.")
                .namespace(NAMESPACE),
        )?;

        let task_runs = CounterVec::new(
            Opts::new("task_runs_total", "Total scheduler task cycles by task.")
                .namespace(NAMESPACE),
            &["task"],
        )?;
        let task_errors = CounterVec::new(
            Opts::new(
                "task_errors_total",
                "Total failed scheduler task cycles by task.",
            )
            .namespace(NAMESPACE),
            &["task"],
        )?;
        let task_duration = HistogramVec::new(
            HistogramOpts::new(
                "task_duration_seconds",
                "Scheduler task cycle duration by task.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["task"],
        )?;

        registry.register(Box::new(samples_received.clone()))?;
        registry.register(Box::new(samples_unmonitored.clone()))?;
        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_mapped.clone()))?;
        registry.register(Box::new(ingest_rejected.clone()))?;

        registry.register(Box::new(deltas_appended.clone()))?;
        registry.register(Box::new(deltas_released.clone()))?;
        registry.register(Box::new(deltas_suppressed.clone()))?;
        registry.register(Box::new(deltas_rejected.clone()))?;
        registry.register(Box::new(datamap_held.clone()))?;
        registry.register(Box::new(blacklisted.clone()))?;
        registry.register(Box::new(discoveries.clone()))?;
        registry.register(Box::new(target_systems.clone()))?;

        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(metric_writes.clone()))?;
        registry.register(Box::new(events_sent.clone()))?;
        registry.register(Box::new(model_batches.clone()))?;

        registry.register(Box::new(task_runs.clone()))?;
        registry.register(Box::new(task_errors.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;

        Ok(Self {
            registry,
            samples_received,
            samples_unmonitored,
            events_received,
            events_mapped,
            ingest_rejected,
            deltas_appended,
            deltas_released,
            deltas_suppressed,
            deltas_rejected,
            datamap_held,
            blacklisted,
            discoveries,
            target_systems,
            queue_depth,
            metric_writes,
            events_sent,
            model_batches,
            task_runs,
            task_errors,
            task_duration,
        })
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_use_namespace() {
        let health = HealthMetrics::new().expect("metrics");
        health.samples_received.inc();
        health.task_errors.with_label_values(&["metric-flush"]).inc();

        let text = health.encode_text().expect("encode");
        assert!(text.contains("fleetsync_samples_received_total 1"));
        assert!(text.contains("fleetsync_task_errors_total{task=\"metric-flush\"} 1"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = HealthMetrics::new().expect("metrics a");
        let b = HealthMetrics::new().expect("metrics b");
        a.discoveries.inc();
        assert_eq!(a.discoveries.get(), 1.0);
        assert_eq!(b.discoveries.get(), 0.0);
    }
}
