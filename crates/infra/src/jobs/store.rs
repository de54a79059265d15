//! Job queue storage: the five-container state machine.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use courier_core::JobId;
use courier_observability::{DispatchMetrics, NoopMetrics};

use super::types::{JobRecord, JobState, QueueStats, RetentionPolicy, score_ms};

/// Durable queue store abstraction.
///
/// Every method is a single atomic step against the backing store: it either
/// applies its whole change or returns an error. Transitions out of
/// Processing require the claim token handed out by `claim_next`.
pub trait JobQueue: Send + Sync {
    /// Insert a new job into Pending.
    fn submit(&self, job: JobRecord) -> Result<JobId, QueueError>;

    /// Move the earliest eligible Pending/Retrying job into Processing.
    /// Returns None if no job is eligible at `now`.
    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<JobRecord>, QueueError>;

    /// Persist attempt bookkeeping before the gateway call.
    fn record_attempt(&self, job: &JobRecord) -> Result<(), QueueError>;

    /// Processing -> Completed.
    fn complete(&self, job: &mut JobRecord, now: DateTime<Utc>) -> Result<(), QueueError>;

    /// Processing -> Retrying, eligible again at `now + delay`.
    fn retry(
        &self,
        job: &mut JobRecord,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Processing -> Failed.
    fn fail(&self, job: &mut JobRecord, error: &str, now: DateTime<Utc>) -> Result<(), QueueError>;

    /// Container cardinalities.
    fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Container currently holding `id`, None if it is in none of them.
    fn status_of(&self, id: JobId) -> Result<Option<JobState>, QueueError>;

    /// Load a job's record with its current state.
    fn get(&self, id: JobId) -> Result<Option<JobRecord>, QueueError>;

    /// Return jobs claimed longer than `lease` ago to Retrying, or Failed
    /// when their attempts are used up. Returns how many were moved.
    fn requeue_stale(&self, now: DateTime<Utc>, lease: Duration) -> Result<usize, QueueError>;

    /// Drop terminal jobs whose retention window has passed.
    fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, QueueError>;
}

/// Job queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("store connection error: {0}")]
    Connection(String),
    #[error("store command error: {0}")]
    Command(String),
    #[error("job {job_id} has malformed data: {reason}")]
    Serialization { job_id: String, reason: String },
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {0} is not held under this claim")]
    NotClaimed(JobId),
    #[error("retry delay must be positive")]
    InvalidDelay,
}

impl QueueError {
    /// The store could not be reached; the operation may succeed later.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, QueueError::Connection(_))
    }
}

pub(crate) const LEASE_EXPIRED_ERROR: &str = "claim lease expired before the attempt was resolved";

/// Durations beyond chrono's range are clamped to a century.
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Ready-set key: schedule, then insertion sequence.
type Slot = (DateTime<Utc>, u64, JobId);

#[derive(Debug, Default)]
struct Containers {
    records: HashMap<JobId, JobRecord>,
    pending: BTreeSet<Slot>,
    retry: BTreeSet<Slot>,
    /// Current slot of every job in `pending` or `retry`
    slots: HashMap<JobId, Slot>,
    next_seq: u64,
    /// Claim token (claim time in ms) per claimed job
    processing: HashMap<JobId, i64>,
    completed: HashMap<JobId, DateTime<Utc>>,
    failed: HashMap<JobId, DateTime<Utc>>,
    delivered: u64,
}

impl Containers {
    fn enqueue(&mut self, id: JobId, at: DateTime<Utc>, retrying: bool) {
        let slot = (at, self.next_seq, id);
        self.next_seq += 1;
        if retrying {
            self.retry.insert(slot);
        } else {
            self.pending.insert(slot);
        }
        self.slots.insert(id, slot);
    }

    fn state_of(&self, id: JobId) -> Option<JobState> {
        if let Some(slot) = self.slots.get(&id) {
            if self.pending.contains(slot) {
                return Some(JobState::Pending);
            }
            if self.retry.contains(slot) {
                return Some(JobState::Retrying);
            }
        }
        if self.processing.contains_key(&id) {
            Some(JobState::Processing)
        } else if self.completed.contains_key(&id) {
            Some(JobState::Completed)
        } else if self.failed.contains_key(&id) {
            Some(JobState::Failed)
        } else {
            None
        }
    }

    fn take_claim(&mut self, job: &JobRecord) -> Result<(), QueueError> {
        match (self.processing.get(&job.id), job.claim_token) {
            (Some(held), Some(token)) if *held == token => {
                self.processing.remove(&job.id);
                Ok(())
            }
            _ => Err(QueueError::NotClaimed(job.id)),
        }
    }
}

/// In-memory job queue for tests/dev and single-process deployments.
///
/// One mutex guards all containers, so every operation is atomic.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    inner: Mutex<Containers>,
    retention: RetentionPolicy,
    metrics: Arc<dyn DispatchMetrics>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Containers::default()),
            retention: RetentionPolicy::default(),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn DispatchMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Containers>, QueueError> {
        self.inner
            .lock()
            .map_err(|_| QueueError::Command("in-memory queue lock poisoned".to_string()))
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue for InMemoryJobQueue {
    fn submit(&self, mut job: JobRecord) -> Result<JobId, QueueError> {
        let mut c = self.lock()?;
        if c.records.contains_key(&job.id) {
            return Err(QueueError::AlreadyExists(job.id));
        }
        let id = job.id;
        job.state = JobState::Pending;
        job.claim_token = None;
        c.enqueue(id, job.scheduled_for, false);
        c.records.insert(id, job);
        drop(c);

        self.metrics.job_submitted();
        Ok(id)
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<JobRecord>, QueueError> {
        let mut c = self.lock()?;

        // Merge both ready containers by (scheduled_for, insertion order).
        let head_pending = c.pending.first().copied().filter(|(at, _, _)| *at <= now);
        let head_retry = c.retry.first().copied().filter(|(at, _, _)| *at <= now);

        let (key, from_retry) = match (head_pending, head_retry) {
            (None, None) => return Ok(None),
            (Some(p), None) => (p, false),
            (None, Some(r)) => (r, true),
            (Some(p), Some(r)) => {
                if p <= r {
                    (p, false)
                } else {
                    (r, true)
                }
            }
        };

        if from_retry {
            c.retry.remove(&key);
        } else {
            c.pending.remove(&key);
        }

        let token = now.timestamp_millis();
        let id = key.2;
        c.slots.remove(&id);
        c.processing.insert(id, token);

        let Some(record) = c.records.get_mut(&id) else {
            return Err(QueueError::Serialization {
                job_id: id.to_string(),
                reason: "record missing".to_string(),
            });
        };
        record.state = JobState::Processing;
        record.claim_token = Some(token);
        Ok(Some(record.clone()))
    }

    fn record_attempt(&self, job: &JobRecord) -> Result<(), QueueError> {
        let mut c = self.lock()?;
        match (c.processing.get(&job.id), job.claim_token) {
            (Some(held), Some(token)) if *held == token => {}
            _ => return Err(QueueError::NotClaimed(job.id)),
        }
        if let Some(record) = c.records.get_mut(&job.id) {
            record.attempts = job.attempts;
            record.last_attempt_at = job.last_attempt_at;
            record.last_error = job.last_error.clone();
        }
        Ok(())
    }

    fn complete(&self, job: &mut JobRecord, now: DateTime<Utc>) -> Result<(), QueueError> {
        let mut c = self.lock()?;
        c.take_claim(job)?;

        job.state = JobState::Completed;
        job.claim_token = None;
        c.completed.insert(job.id, now);
        c.records.insert(job.id, job.clone());
        c.delivered += 1;
        Ok(())
    }

    fn retry(
        &self,
        job: &mut JobRecord,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        if delay.is_zero() {
            return Err(QueueError::InvalidDelay);
        }
        let mut c = self.lock()?;
        c.take_claim(job)?;

        job.state = JobState::Retrying;
        job.claim_token = None;
        job.scheduled_for = now + to_chrono(delay);
        c.enqueue(job.id, job.scheduled_for, true);
        c.records.insert(job.id, job.clone());
        Ok(())
    }

    fn fail(&self, job: &mut JobRecord, error: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        let mut c = self.lock()?;
        c.take_claim(job)?;

        job.state = JobState::Failed;
        job.claim_token = None;
        job.last_error = error.to_string();
        c.failed.insert(job.id, now);
        c.records.insert(job.id, job.clone());
        Ok(())
    }

    fn stats(&self) -> Result<QueueStats, QueueError> {
        let c = self.lock()?;
        Ok(QueueStats {
            pending: c.pending.len() as u64,
            retry: c.retry.len() as u64,
            processing: c.processing.len() as u64,
            completed: c.completed.len() as u64,
            failed: c.failed.len() as u64,
            total_delivered: c.delivered,
        })
    }

    fn status_of(&self, id: JobId) -> Result<Option<JobState>, QueueError> {
        let c = self.lock()?;
        Ok(c.state_of(id))
    }

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        let c = self.lock()?;
        let Some(state) = c.state_of(id) else {
            return Ok(None);
        };
        Ok(c.records.get(&id).map(|job| {
            let mut job = job.clone();
            job.state = state;
            job.claim_token = None;
            job
        }))
    }

    fn requeue_stale(&self, now: DateTime<Utc>, lease: Duration) -> Result<usize, QueueError> {
        let cutoff = score_ms(now - to_chrono(lease));
        let mut guard = self.lock()?;
        let c = &mut *guard;

        let stale: Vec<JobId> = c
            .processing
            .iter()
            .filter(|(_, token)| **token <= cutoff)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            c.processing.remove(id);
            let exhausted = match c.records.get_mut(id) {
                Some(record) => {
                    record.last_error = LEASE_EXPIRED_ERROR.to_string();
                    if record.attempts < record.max_attempts {
                        record.scheduled_for = now;
                        false
                    } else {
                        true
                    }
                }
                None => true,
            };
            if exhausted {
                c.failed.insert(*id, now);
            } else {
                c.enqueue(*id, now, true);
            }
            warn!(job_id = %id, exhausted, "requeued job with expired claim lease");
        }

        drop(guard);
        if !stale.is_empty() {
            self.metrics.jobs_requeued(stale.len());
        }
        Ok(stale.len())
    }

    fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let completed_cutoff = now - to_chrono(self.retention.completed);
        let failed_cutoff = now - to_chrono(self.retention.failed);
        let mut guard = self.lock()?;
        let c = &mut *guard;

        let expired: Vec<JobId> = c
            .completed
            .iter()
            .filter(|(_, at)| **at <= completed_cutoff)
            .chain(c.failed.iter().filter(|(_, at)| **at <= failed_cutoff))
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            c.completed.remove(id);
            c.failed.remove(id);
            c.records.remove(id);
        }
        Ok(expired.len())
    }
}

impl<Q: JobQueue + ?Sized> JobQueue for Arc<Q> {
    fn submit(&self, job: JobRecord) -> Result<JobId, QueueError> {
        (**self).submit(job)
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<JobRecord>, QueueError> {
        (**self).claim_next(now)
    }

    fn record_attempt(&self, job: &JobRecord) -> Result<(), QueueError> {
        (**self).record_attempt(job)
    }

    fn complete(&self, job: &mut JobRecord, now: DateTime<Utc>) -> Result<(), QueueError> {
        (**self).complete(job, now)
    }

    fn retry(
        &self,
        job: &mut JobRecord,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        (**self).retry(job, delay, now)
    }

    fn fail(&self, job: &mut JobRecord, error: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        (**self).fail(job, error, now)
    }

    fn stats(&self) -> Result<QueueStats, QueueError> {
        (**self).stats()
    }

    fn status_of(&self, id: JobId) -> Result<Option<JobState>, QueueError> {
        (**self).status_of(id)
    }

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        (**self).get(id)
    }

    fn requeue_stale(&self, now: DateTime<Utc>, lease: Duration) -> Result<usize, QueueError> {
        (**self).requeue_stale(now, lease)
    }

    fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        (**self).prune_expired(now)
    }
}
