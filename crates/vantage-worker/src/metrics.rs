//! Prometheus metrics for worker observability.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::Arc;

#[derive(Clone)]
pub struct WorkerMetrics {
    pub domains_in_flight: Gauge,
    pub domains_completed: Counter,
    pub domains_failed: Counter,
    pub records_persisted: Counter,
    pub records_streamed: Counter,
    pub records_out_of_scope: Counter,
    pub records_deduped: Counter,
    pub stream_records_consumed: Counter,
    pub stream_acks: Counter,
    pub stream_claimed: Counter,
    pub registry: Arc<Registry>,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let domains_in_flight = Gauge::default();
        registry.register(
            "vantage_worker_domains_in_flight",
            "Domains currently being scanned",
            domains_in_flight.clone(),
        );

        let domains_completed = Counter::default();
        registry.register(
            "vantage_worker_domains_completed_total",
            "Domains scanned to completion",
            domains_completed.clone(),
        );

        let domains_failed = Counter::default();
        registry.register(
            "vantage_worker_domains_failed_total",
            "Domains that exhausted their retry budget",
            domains_failed.clone(),
        );

        let records_persisted = Counter::default();
        registry.register(
            "vantage_worker_records_persisted_total",
            "Discovery records written to the store",
            records_persisted.clone(),
        );

        let records_streamed = Counter::default();
        registry.register(
            "vantage_worker_records_streamed_total",
            "Discovery records appended to the output stream",
            records_streamed.clone(),
        );

        let records_out_of_scope = Counter::default();
        registry.register(
            "vantage_worker_records_out_of_scope_total",
            "Records dropped by the apex-domain scope filter",
            records_out_of_scope.clone(),
        );

        let records_deduped = Counter::default();
        registry.register(
            "vantage_worker_records_deduped_total",
            "Records suppressed by the in-memory dedup set",
            records_deduped.clone(),
        );

        let stream_records_consumed = Counter::default();
        registry.register(
            "vantage_worker_stream_records_consumed_total",
            "Stream entries processed by the consumer loop",
            stream_records_consumed.clone(),
        );

        let stream_acks = Counter::default();
        registry.register(
            "vantage_worker_stream_acks_total",
            "Stream entries acknowledged",
            stream_acks.clone(),
        );

        let stream_claimed = Counter::default();
        registry.register(
            "vantage_worker_stream_claimed_total",
            "Stream entries reclaimed from idle consumers",
            stream_claimed.clone(),
        );

        Self {
            domains_in_flight,
            domains_completed,
            domains_failed,
            records_persisted,
            records_streamed,
            records_out_of_scope,
            records_deduped,
            stream_records_consumed,
            stream_acks,
            stream_claimed,
            registry: Arc::new(registry),
        }
    }

    /// Encode all metrics as Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        encode(&mut buf, &self.registry).unwrap_or_default();
        buf
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
