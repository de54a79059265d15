//! Metrics sinks.
//!
//! Queue stores and dispatch workers receive an `Arc<dyn DispatchMetrics>` at
//! construction. `PrometheusMetrics` owns its own `Registry` instead of the
//! process-wide default, so two queues in one process never share counters.

use std::time::Duration;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Coarse classification of a delivery attempt, for counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    Delivered,
    Rejected,
    Transient,
}

impl DeliveryResult {
    fn label(self) -> &'static str {
        match self {
            DeliveryResult::Delivered => "delivered",
            DeliveryResult::Rejected => "rejected",
            DeliveryResult::Transient => "transient",
        }
    }
}

/// Observability hooks for the dispatch subsystem.
///
/// Every method has a no-op default so sinks only override what they record.
pub trait DispatchMetrics: Send + Sync + core::fmt::Debug {
    fn job_submitted(&self) {}

    fn job_claimed(&self) {}

    fn delivery_attempted(&self, _result: DeliveryResult, _elapsed: Duration) {}

    fn job_completed(&self) {}

    fn job_retried(&self, _delay: Duration) {}

    fn job_failed(&self) {}

    fn jobs_requeued(&self, _count: usize) {}

    fn store_error(&self, _operation: &'static str) {}
}

/// Sink that records nothing. The default for every component.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl DispatchMetrics for NoopMetrics {}

/// Errors from building or encoding the registry.
pub type MetricsError = prometheus::Error;

/// Point-in-time read of the Prometheus counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub claimed: u64,
    pub attempts_delivered: u64,
    pub attempts_rejected: u64,
    pub attempts_transient: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub requeued: u64,
    pub store_errors: u64,
    pub gateway_calls: u64,
    pub gateway_seconds: f64,
}

const STORE_ERRORS: &str = "courier_store_errors_total";

// Gateway calls time out at 30 s by default.
const GATEWAY_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

const RETRY_DELAY_BUCKETS: &[f64] = &[1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0];

/// Prometheus sink, shareable across worker threads.
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    submitted: IntCounter,
    claimed: IntCounter,
    processed: IntCounterVec,
    sent: IntCounterVec,
    gateway_duration: Histogram,
    retry_delay: Histogram,
    store_errors: IntCounterVec,
}

impl core::fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PrometheusMetrics")
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let submitted =
            IntCounter::new("courier_jobs_submitted_total", "Jobs accepted by the queue")?;
        let claimed = IntCounter::new("courier_jobs_claimed_total", "Jobs claimed by a worker")?;
        let processed = IntCounterVec::new(
            Opts::new("courier_jobs_processed_total", "Job transitions by outcome"),
            &["status"],
        )?;
        let sent = IntCounterVec::new(
            Opts::new("courier_sms_sent_total", "Gateway calls by result"),
            &["status"],
        )?;
        let gateway_duration = Histogram::with_opts(
            HistogramOpts::new("courier_gateway_duration_seconds", "Time spent in gateway calls")
                .buckets(GATEWAY_BUCKETS.to_vec()),
        )?;
        let retry_delay = Histogram::with_opts(
            HistogramOpts::new("courier_retry_delay_seconds", "Backoff chosen for each retry")
                .buckets(RETRY_DELAY_BUCKETS.to_vec()),
        )?;
        let store_errors = IntCounterVec::new(
            Opts::new(STORE_ERRORS, "Queue store calls that failed"),
            &["operation"],
        )?;

        registry.register(Box::new(submitted.clone()))?;
        registry.register(Box::new(claimed.clone()))?;
        registry.register(Box::new(processed.clone()))?;
        registry.register(Box::new(sent.clone()))?;
        registry.register(Box::new(gateway_duration.clone()))?;
        registry.register(Box::new(retry_delay.clone()))?;
        registry.register(Box::new(store_errors.clone()))?;

        Ok(Self {
            registry,
            submitted,
            claimed,
            processed,
            sent,
            gateway_duration,
            retry_delay,
            store_errors,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode every registered family in the Prometheus text format.
    pub fn render(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted.get(),
            claimed: self.claimed.get(),
            attempts_delivered: self.sent.with_label_values(&["delivered"]).get(),
            attempts_rejected: self.sent.with_label_values(&["rejected"]).get(),
            attempts_transient: self.sent.with_label_values(&["transient"]).get(),
            completed: self.processed.with_label_values(&["completed"]).get(),
            retried: self.processed.with_label_values(&["retried"]).get(),
            failed: self.processed.with_label_values(&["failed"]).get(),
            requeued: self.processed.with_label_values(&["requeued"]).get(),
            store_errors: self.family_total(STORE_ERRORS),
            gateway_calls: self.gateway_duration.get_sample_count(),
            gateway_seconds: self.gateway_duration.get_sample_sum(),
        }
    }

    fn family_total(&self, name: &str) -> u64 {
        self.registry
            .gather()
            .iter()
            .filter(|family| family.get_name() == name)
            .flat_map(|family| family.get_metric())
            .map(|metric| metric.get_counter().get_value() as u64)
            .sum()
    }
}

impl DispatchMetrics for PrometheusMetrics {
    fn job_submitted(&self) {
        self.submitted.inc();
    }

    fn job_claimed(&self) {
        self.claimed.inc();
    }

    fn delivery_attempted(&self, result: DeliveryResult, elapsed: Duration) {
        self.sent.with_label_values(&[result.label()]).inc();
        self.gateway_duration.observe(elapsed.as_secs_f64());
    }

    fn job_completed(&self) {
        self.processed.with_label_values(&["completed"]).inc();
    }

    fn job_retried(&self, delay: Duration) {
        self.processed.with_label_values(&["retried"]).inc();
        self.retry_delay.observe(delay.as_secs_f64());
    }

    fn job_failed(&self) {
        self.processed.with_label_values(&["failed"]).inc();
    }

    fn jobs_requeued(&self, count: usize) {
        self.processed
            .with_label_values(&["requeued"])
            .inc_by(count as u64);
    }

    fn store_error(&self, operation: &'static str) {
        self.store_errors.with_label_values(&[operation]).inc();
    }
}
