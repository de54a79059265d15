//! Producer-facing notification API.
//!
//! Business code calls into this service to enqueue messages; it never talks
//! to the gateway and never waits for a delivery.

use std::sync::Arc;

use tracing::{info, warn};

use courier_core::{DomainError, JobId};
use courier_observability::{DispatchMetrics, NoopMetrics};

use super::store::{JobQueue, QueueError};
use super::types::{JobRecord, JobStatus, QueueStats};

/// Default attempt budget for new notifications.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Largest per-job attempt budget accepted at submission.
///
/// The default retry policy keeps every gap below its cap up to this many
/// attempts.
pub const DEFAULT_MAX_ATTEMPTS_CEILING: u32 = 10;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Invalid(#[from] DomainError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Enqueues notifications and answers status queries.
#[derive(Debug)]
pub struct NotificationService<Q: JobQueue> {
    queue: Q,
    metrics: Arc<dyn DispatchMetrics>,
    default_max_attempts: u32,
    max_attempts_ceiling: u32,
}

impl<Q: JobQueue> NotificationService<Q> {
    pub fn new(queue: Q) -> Self {
        Self {
            queue,
            metrics: Arc::new(NoopMetrics),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_attempts_ceiling: DEFAULT_MAX_ATTEMPTS_CEILING,
        }
    }

    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    /// Reject per-job budgets above `ceiling`.
    pub fn with_max_attempts_ceiling(mut self, ceiling: u32) -> Self {
        self.max_attempts_ceiling = ceiling;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn DispatchMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Validate and enqueue one notification.
    pub fn submit_notification(
        &self,
        recipient: &str,
        payload: &str,
        correlation_ref: &str,
        max_attempts: Option<u32>,
    ) -> Result<JobId, SubmitError> {
        let max_attempts = max_attempts.unwrap_or(self.default_max_attempts);
        if max_attempts > self.max_attempts_ceiling {
            return Err(DomainError::validation(format!(
                "max_attempts {max_attempts} exceeds the limit of {}",
                self.max_attempts_ceiling
            ))
            .into());
        }
        let job = JobRecord::new(recipient, payload, correlation_ref, max_attempts)?;
        let job_id = self.queue.submit(job).inspect_err(|_| {
            self.metrics.store_error("submit");
        })?;

        info!(%job_id, correlation_ref, max_attempts, "notification queued");
        Ok(job_id)
    }

    /// Enqueue without letting a failure reach the caller.
    ///
    /// For producers whose own operation must succeed whether or not the
    /// notification could be queued.
    pub fn submit_best_effort(
        &self,
        recipient: &str,
        payload: &str,
        correlation_ref: &str,
    ) -> Option<JobId> {
        match self.submit_notification(recipient, payload, correlation_ref, None) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(correlation_ref, error = %e, "notification not queued");
                None
            }
        }
    }

    pub fn queue_stats(&self) -> Result<QueueStats, QueueError> {
        self.queue.stats()
    }

    /// Current status of a job; `Unknown` if the store has no trace of it.
    pub fn job_status(&self, id: JobId) -> Result<JobStatus, QueueError> {
        Ok(self.queue.status_of(id)?.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use chrono::{DateTime, Utc};

    use crate::jobs::store::InMemoryJobQueue;
    use crate::jobs::types::JobState;

    #[test]
    fn submit_uses_default_attempt_budget() {
        let service = NotificationService::new(InMemoryJobQueue::arc());
        let id = service
            .submit_notification("+254700000000", "hello", "order-1", None)
            .unwrap();

        let job = service.queue().get(id).unwrap().unwrap();
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(job.correlation_ref, "order-1");
        assert_eq!(service.job_status(id).unwrap(), JobStatus::Pending);
        assert_eq!(service.queue_stats().unwrap().pending, 1);
    }

    #[test]
    fn submit_validates_input() {
        let service = NotificationService::new(InMemoryJobQueue::arc());
        assert!(matches!(
            service.submit_notification("", "hello", "order-1", None),
            Err(SubmitError::Invalid(_))
        ));
        assert!(matches!(
            service.submit_notification("+254700000000", "hello", "order-1", Some(0)),
            Err(SubmitError::Invalid(_))
        ));
        assert_eq!(service.queue_stats().unwrap().pending, 0);
    }

    #[test]
    fn attempt_budget_above_ceiling_is_rejected() {
        let service = NotificationService::new(InMemoryJobQueue::arc());
        let too_many = Some(DEFAULT_MAX_ATTEMPTS_CEILING + 1);
        assert!(matches!(
            service.submit_notification("+254700000000", "hello", "order-1", too_many),
            Err(SubmitError::Invalid(DomainError::Validation(_)))
        ));
        assert!(
            service
                .submit_notification("+254700000000", "hello", "order-1", Some(u32::MAX))
                .is_err()
        );
        assert_eq!(service.queue_stats().unwrap().pending, 0);

        let id = service
            .submit_notification(
                "+254700000000",
                "hello",
                "order-1",
                Some(DEFAULT_MAX_ATTEMPTS_CEILING),
            )
            .unwrap();
        assert_eq!(
            service.queue().get(id).unwrap().unwrap().max_attempts,
            DEFAULT_MAX_ATTEMPTS_CEILING
        );

        let strict = NotificationService::new(InMemoryJobQueue::arc()).with_max_attempts_ceiling(2);
        assert!(strict.submit_notification("+254700000000", "hi", "o", Some(3)).is_err());
    }

    #[test]
    fn unknown_job_status() {
        let service = NotificationService::new(InMemoryJobQueue::arc());
        assert_eq!(service.job_status(JobId::new()).unwrap(), JobStatus::Unknown);
    }

    #[derive(Debug)]
    struct DownQueue;

    fn down<T>() -> Result<T, QueueError> {
        Err(QueueError::Connection("connection refused".into()))
    }

    impl JobQueue for DownQueue {
        fn submit(&self, _job: JobRecord) -> Result<JobId, QueueError> {
            down()
        }
        fn claim_next(&self, _now: DateTime<Utc>) -> Result<Option<JobRecord>, QueueError> {
            down()
        }
        fn record_attempt(&self, _job: &JobRecord) -> Result<(), QueueError> {
            down()
        }
        fn complete(&self, _job: &mut JobRecord, _now: DateTime<Utc>) -> Result<(), QueueError> {
            down()
        }
        fn retry(
            &self,
            _job: &mut JobRecord,
            _delay: Duration,
            _now: DateTime<Utc>,
        ) -> Result<(), QueueError> {
            down()
        }
        fn fail(
            &self,
            _job: &mut JobRecord,
            _error: &str,
            _now: DateTime<Utc>,
        ) -> Result<(), QueueError> {
            down()
        }
        fn stats(&self) -> Result<QueueStats, QueueError> {
            down()
        }
        fn status_of(&self, _id: JobId) -> Result<Option<JobState>, QueueError> {
            down()
        }
        fn get(&self, _id: JobId) -> Result<Option<JobRecord>, QueueError> {
            down()
        }
        fn requeue_stale(
            &self,
            _now: DateTime<Utc>,
            _lease: Duration,
        ) -> Result<usize, QueueError> {
            down()
        }
        fn prune_expired(&self, _now: DateTime<Utc>) -> Result<usize, QueueError> {
            down()
        }
    }

    /// Stand-in for a business operation that notifies as a side effect.
    fn place_order(service: &NotificationService<DownQueue>, orders: &mut Vec<String>) -> String {
        let order_id = format!("order-{}", orders.len() + 1);
        orders.push(order_id.clone());
        service.submit_best_effort("+254700000000", "Your order was received", &order_id);
        order_id
    }

    #[test]
    fn store_outage_does_not_fail_the_producer() {
        let service = NotificationService::new(DownQueue);
        let mut orders = Vec::new();

        let order_id = place_order(&service, &mut orders);
        assert_eq!(order_id, "order-1");
        assert_eq!(orders.len(), 1);

        assert!(matches!(
            service.submit_notification("+254700000000", "hi", "order-2", None),
            Err(SubmitError::Queue(QueueError::Connection(_)))
        ));
        assert!(service.submit_best_effort("+254700000000", "hi", "order-3").is_none());
    }
}
