use std::sync::Arc;

use courier_infra::jobs::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_ATTEMPTS_CEILING, InMemoryJobQueue, JobQueue,
    NotificationService,
};
use courier_observability::{DispatchMetrics, MetricsError, PrometheusMetrics};

/// Handles shared by every request.
pub struct AppServices {
    notifications: NotificationService<Arc<dyn JobQueue>>,
    metrics: Arc<PrometheusMetrics>,
}

impl AppServices {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        metrics: Arc<PrometheusMetrics>,
        default_max_attempts: u32,
        max_attempts_ceiling: u32,
    ) -> Self {
        let sink: Arc<dyn DispatchMetrics> = metrics.clone();
        Self {
            notifications: NotificationService::new(queue)
                .with_metrics(sink)
                .with_default_max_attempts(default_max_attempts)
                .with_max_attempts_ceiling(max_attempts_ceiling),
            metrics,
        }
    }

    /// In-process queue, for local runs and tests.
    pub fn in_memory() -> Result<Self, MetricsError> {
        let metrics = Arc::new(PrometheusMetrics::new()?);
        let queue = InMemoryJobQueue::new().with_metrics(metrics.clone());
        Ok(Self::new(
            Arc::new(queue),
            metrics,
            DEFAULT_MAX_ATTEMPTS,
            DEFAULT_MAX_ATTEMPTS_CEILING,
        ))
    }

    pub fn notifications(&self) -> &NotificationService<Arc<dyn JobQueue>> {
        &self.notifications
    }

    pub fn queue(&self) -> Arc<dyn JobQueue> {
        self.notifications.queue().clone()
    }

    pub fn metrics(&self) -> &Arc<PrometheusMetrics> {
        &self.metrics
    }
}
