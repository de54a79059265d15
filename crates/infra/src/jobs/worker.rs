//! Dispatch worker: claims jobs, calls the delivery client, resolves outcomes.

use std::io;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use courier_core::JobId;
use courier_observability::{DispatchMetrics, NoopMetrics};

use super::store::{JobQueue, QueueError};
use super::types::{JobRecord, RetryPolicy};
use crate::delivery::{DeliveryClient, DeliveryOutcome};

/// Dispatch worker configuration.
#[derive(Debug, Clone)]
pub struct DispatchWorkerConfig {
    /// Name for logging and the thread name
    pub name: String,
    /// Sleep when no job is eligible
    pub poll_interval: Duration,
    /// Sleep after the store failed a claim
    pub store_error_backoff: Duration,
    /// Extra tries for a store call that resolves a claimed job
    pub resolve_retries: u32,
    pub resolve_backoff: Duration,
    /// Claims older than this are handed back by the sweep; None disables it
    pub lease_timeout: Option<Duration>,
    /// How often to run lease sweep and retention pruning
    pub sweep_interval: Duration,
    pub retry_policy: RetryPolicy,
    /// Retry `Rejected` outcomes like transient errors
    pub retry_rejections: bool,
}

impl Default for DispatchWorkerConfig {
    fn default() -> Self {
        Self {
            name: "dispatch-worker".to_string(),
            poll_interval: Duration::from_secs(1),
            store_error_backoff: Duration::from_secs(5),
            resolve_retries: 3,
            resolve_backoff: Duration::from_millis(200),
            lease_timeout: Some(Duration::from_secs(300)),
            sweep_interval: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            retry_rejections: true,
        }
    }
}

impl DispatchWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_retry_rejections(mut self, retry: bool) -> Self {
        self.retry_rejections = retry;
        self
    }
}

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Completed,
    Retrying { delay: Duration },
    Failed { reason: String },
    /// The claim was taken back (lease sweep) before the outcome was recorded.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub attempts: u32,
    pub resolution: Resolution,
}

/// Result of one worker iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// Nothing was eligible.
    Idle,
    Processed(JobOutcome),
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub delivered: u64,
    pub retried: u64,
    pub failed: u64,
    pub store_errors: u64,
}

/// Handle to control a running worker.
///
/// Dropping the handle also stops the worker at its next iteration boundary.
#[derive(Debug)]
pub struct DispatchWorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl DispatchWorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the worker to stop without waiting for it.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Request shutdown and wait for the current iteration to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Request shutdown and wait at most `grace`. Returns false if the worker
    /// was still busy (typically inside a gateway call) when time ran out.
    pub fn shutdown_timeout(mut self, grace: Duration) -> bool {
        let _ = self.shutdown.send(());
        let Some(join) = self.join.take() else {
            return true;
        };
        let deadline = Instant::now() + grace;
        while !join.is_finished() {
            if Instant::now() >= deadline {
                warn!(worker = %self.name, "worker did not stop within grace period");
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let _ = join.join();
        true
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Background dispatch worker.
///
/// Many workers may share one queue; the store's atomic claim keeps them from
/// delivering the same job concurrently.
pub struct DispatchWorker<Q: JobQueue, C: DeliveryClient> {
    queue: Q,
    client: C,
    metrics: Arc<dyn DispatchMetrics>,
    config: DispatchWorkerConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl<Q: JobQueue, C: DeliveryClient> DispatchWorker<Q, C> {
    pub fn new(queue: Q, client: C) -> Self {
        Self {
            queue,
            client,
            metrics: Arc::new(NoopMetrics),
            config: DispatchWorkerConfig::default(),
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn with_config(mut self, config: DispatchWorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn DispatchMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &DispatchWorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn bump(&self, f: impl FnOnce(&mut WorkerStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Spawn the worker on a dedicated thread.
    pub fn spawn(self) -> io::Result<DispatchWorkerHandle>
    where
        Q: 'static,
        C: 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = self.stats.clone();
        let name = self.config.name.clone();

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.run(shutdown_rx))?;

        Ok(DispatchWorkerHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }

    fn run(self, shutdown_rx: mpsc::Receiver<()>) {
        info!(worker = %self.config.name, "dispatch worker started");
        let mut last_sweep: Option<Instant> = None;

        loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            if last_sweep.is_none_or(|t| t.elapsed() >= self.config.sweep_interval) {
                if let Err(e) = self.maintain(Utc::now()) {
                    warn!(worker = %self.config.name, error = %e, "queue maintenance failed");
                }
                last_sweep = Some(Instant::now());
            }

            let wait = match self.run_once(Utc::now()) {
                Ok(Tick::Idle) => Some(self.config.poll_interval),
                Ok(Tick::Processed(_)) => None,
                // The store already parked the unreadable job in Failed.
                Err(QueueError::Serialization { .. }) => None,
                Err(e) => {
                    error!(worker = %self.config.name, error = %e, "store error, backing off");
                    Some(self.config.store_error_backoff)
                }
            };

            if let Some(wait) = wait {
                match shutdown_rx.recv_timeout(wait) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
        }

        info!(worker = %self.config.name, "dispatch worker stopped");
    }

    /// Lease sweep (when enabled) and retention pruning.
    /// Returns how many stale claims were handed back.
    pub fn maintain(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let requeued = match self.config.lease_timeout {
            Some(lease) => self.queue.requeue_stale(now, lease)?,
            None => 0,
        };
        let pruned = self.queue.prune_expired(now)?;
        if requeued > 0 || pruned > 0 {
            debug!(worker = %self.config.name, requeued, pruned, "queue maintenance");
        }
        Ok(requeued)
    }

    /// Run a single iteration: claim at most one job and resolve it.
    pub fn run_once(&self, now: DateTime<Utc>) -> Result<Tick, QueueError> {
        let claimed = self.queue.claim_next(now).inspect_err(|e| {
            self.metrics.store_error("claim_next");
            self.bump(|s| s.store_errors += 1);
            if let QueueError::Serialization { job_id, reason } = e {
                error!(worker = %self.config.name, %job_id, %reason, "dropped unreadable job");
            }
        })?;

        let Some(mut job) = claimed else {
            return Ok(Tick::Idle);
        };
        self.metrics.job_claimed();

        job.begin_attempt(now);
        debug!(
            worker = %self.config.name,
            job_id = %job.id,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "claimed job"
        );

        let recorded = self.with_retries("record_attempt", || self.queue.record_attempt(&job));
        let resolution = match recorded {
            Ok(()) => self.deliver(&mut job, now)?,
            Err(QueueError::NotClaimed(_)) => Resolution::Abandoned,
            Err(e) => return Err(e),
        };

        if resolution == Resolution::Abandoned {
            warn!(
                worker = %self.config.name,
                job_id = %job.id,
                "claim lost before the attempt was resolved"
            );
        }
        self.bump(|s| {
            s.processed += 1;
            match resolution {
                Resolution::Completed => s.delivered += 1,
                Resolution::Retrying { .. } => s.retried += 1,
                Resolution::Failed { .. } => s.failed += 1,
                Resolution::Abandoned => {}
            }
        });

        Ok(Tick::Processed(JobOutcome {
            job_id: job.id,
            attempts: job.attempts,
            resolution,
        }))
    }

    fn deliver(&self, job: &mut JobRecord, now: DateTime<Utc>) -> Result<Resolution, QueueError> {
        let started = Instant::now();
        let outcome = self.client.send(&job.recipient, &job.payload);
        self.metrics
            .delivery_attempted(outcome.result(), started.elapsed());

        // Never resolve earlier than the claim, even with a synthetic clock.
        let resolved_at = now.max(Utc::now());

        let result = match outcome {
            DeliveryOutcome::Delivered { message_id } => self
                .with_retries("complete", || self.queue.complete(job, resolved_at))
                .map(|()| {
                    info!(
                        worker = %self.config.name,
                        job_id = %job.id,
                        correlation_ref = %job.correlation_ref,
                        %message_id,
                        attempts = job.attempts,
                        "message delivered"
                    );
                    self.metrics.job_completed();
                    Resolution::Completed
                }),
            failure => {
                let rejected = matches!(failure, DeliveryOutcome::Rejected(_));
                let reason = failure.reason().unwrap_or_default().to_string();
                job.record_failure(reason.clone());

                if job.attempts_exhausted() || (rejected && !self.config.retry_rejections) {
                    self.with_retries("fail", || self.queue.fail(job, &reason, resolved_at))
                        .map(|()| {
                            warn!(
                                worker = %self.config.name,
                                job_id = %job.id,
                                correlation_ref = %job.correlation_ref,
                                attempts = job.attempts,
                                error = %reason,
                                "delivery failed permanently"
                            );
                            self.metrics.job_failed();
                            Resolution::Failed { reason }
                        })
                } else {
                    let delay = self.config.retry_policy.delay_for_attempt(job.attempts);
                    self.with_retries("retry", || self.queue.retry(job, delay, resolved_at))
                        .map(|()| {
                            info!(
                                worker = %self.config.name,
                                job_id = %job.id,
                                attempts = job.attempts,
                                delay_ms = delay.as_millis() as u64,
                                error = %job.last_error,
                                "delivery failed, retry scheduled"
                            );
                            self.metrics.job_retried(delay);
                            Resolution::Retrying { delay }
                        })
                }
            }
        };

        match result {
            Ok(resolution) => Ok(resolution),
            Err(QueueError::NotClaimed(_)) => Ok(Resolution::Abandoned),
            Err(e) => {
                error!(
                    worker = %self.config.name,
                    job_id = %job.id,
                    error = %e,
                    "could not record delivery outcome, job left for the lease sweep"
                );
                Err(e)
            }
        }
    }

    /// Retry a store call that must not be lost. Ownership and validation
    /// errors are returned immediately.
    fn with_retries<T>(
        &self,
        operation: &'static str,
        mut f: impl FnMut() -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let mut tries = 0;
        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err(
                    e @ (QueueError::NotClaimed(_)
                    | QueueError::InvalidDelay
                    | QueueError::Serialization { .. }),
                ) => return Err(e),
                Err(e) => {
                    self.metrics.store_error(operation);
                    self.bump(|s| s.store_errors += 1);
                    if tries >= self.config.resolve_retries {
                        return Err(e);
                    }
                    tries += 1;
                    warn!(
                        worker = %self.config.name,
                        operation,
                        tries,
                        error = %e,
                        "store call failed, retrying"
                    );
                    thread::sleep(self.config.resolve_backoff);
                }
            }
        }
    }
}
