//! Tracing, logging, metrics (shared setup).

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Injected metrics sinks for the queue and the dispatch workers.
pub mod metrics;

pub use metrics::{
    DeliveryResult, DispatchMetrics, MetricsError, MetricsSnapshot, NoopMetrics, PrometheusMetrics,
};
pub use tracing::{LogFormat, init};
