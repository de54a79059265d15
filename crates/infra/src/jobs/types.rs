//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{DomainError, DomainResult, JobId};

use super::store::to_chrono;

/// Container a job currently belongs to.
///
/// Stores track this through container membership; the serialized record
/// never carries it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Submitted, waiting for its first claim
    #[default]
    Pending,
    /// Claimed by exactly one worker
    Processing,
    /// Failed at least once, waiting for its backoff to elapse
    Retrying,
    /// Delivered
    Completed,
    /// Exhausted its attempts (or had unrecoverable data)
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Retrying => "retrying",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer to a status query.
///
/// `Unknown` is a valid answer: the job never existed or its retention
/// window has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Retrying,
    Completed,
    Failed,
    Unknown,
}

impl From<Option<JobState>> for JobStatus {
    fn from(state: Option<JobState>) -> Self {
        match state {
            Some(JobState::Pending) => JobStatus::Pending,
            Some(JobState::Processing) => JobStatus::Processing,
            Some(JobState::Retrying) => JobStatus::Retrying,
            Some(JobState::Completed) => JobStatus::Completed,
            Some(JobState::Failed) => JobStatus::Failed,
            None => JobStatus::Unknown,
        }
    }
}

/// Growth curve of the retry delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// base * attempt^2
    Quadratic,
    /// base * 2^(attempt - 1)
    Exponential,
    /// base * attempt
    Linear,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Quadratic
    }
}

impl BackoffStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quadratic" => Some(Self::Quadratic),
            "exponential" => Some(Self::Exponential),
            "linear" => Some(Self::Linear),
            _ => None,
        }
    }
}

/// Retry delay policy.
///
/// Delays are strictly positive and strictly increasing with the attempt
/// number until `max_delay` is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay unit
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60 * 60),
            strategy: BackoffStrategy::Quadratic,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, strategy: BackoffStrategy) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy,
        }
    }

    /// Uncapped delay for a given attempt number (1-indexed), in milliseconds.
    fn raw_delay_ms(&self, attempt: u32) -> u128 {
        let base_ms = self.base_delay.as_millis();
        let n = u128::from(attempt.max(1));
        match self.strategy {
            BackoffStrategy::Quadratic => base_ms.saturating_mul(n.saturating_mul(n)),
            BackoffStrategy::Exponential => {
                let exp = attempt.max(1) - 1;
                if exp >= 64 {
                    u128::MAX
                } else {
                    base_ms.saturating_mul(1u128 << exp)
                }
            }
            BackoffStrategy::Linear => base_ms.saturating_mul(n),
        }
    }

    /// Delay to apply after attempt `attempt` (1-indexed) failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let max_ms = self.max_delay.as_millis();
        let ms = self.raw_delay_ms(attempt).min(max_ms).max(1);
        Duration::from_millis(u64::try_from(ms).unwrap_or(u64::MAX))
    }

    /// Check the policy keeps delays strictly increasing for every retry a
    /// job with `max_attempts` attempts can take.
    pub fn validate(&self, max_attempts: u32) -> Result<(), String> {
        if self.base_delay.is_zero() {
            return Err("retry base delay must be positive".to_string());
        }
        let last_retry = max_attempts.saturating_sub(1);
        if last_retry > 0 && self.raw_delay_ms(last_retry) > self.max_delay.as_millis() {
            return Err(format!(
                "retry max delay {:?} caps the backoff before attempt {} of {}",
                self.max_delay, last_retry, max_attempts
            ));
        }
        Ok(())
    }
}

/// How long terminal job data is kept before it expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub completed: Duration,
    /// Kept longer than `completed` for postmortems.
    pub failed: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed: Duration::from_secs(7 * 24 * 60 * 60),
            failed: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

impl RetentionPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.completed.is_zero() {
            return Err("completed retention must be positive".to_string());
        }
        if self.failed <= self.completed {
            return Err("failed retention must be longer than completed retention".to_string());
        }
        Ok(())
    }
}

/// One outbound notification and its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique, time-ordered job ID
    pub id: JobId,
    /// Business event that triggered the job (e.g. an order id); opaque
    pub correlation_ref: String,
    /// Destination phone number
    pub recipient: String,
    /// Message text
    pub payload: String,
    /// Derived from container membership when loaded from a store
    #[serde(skip)]
    pub state: JobState,
    /// Delivery attempts made so far
    pub attempts: u32,
    /// Attempt ceiling
    pub max_attempts: u32,
    /// Most recent failure, empty until one occurs
    #[serde(default)]
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Not eligible for claiming before this instant
    pub scheduled_for: DateTime<Utc>,
    /// Set by `claim_next`; proves ownership on the transitions out of Processing
    #[serde(skip)]
    pub claim_token: Option<i64>,
}

impl JobRecord {
    /// Create a new job, eligible immediately.
    pub fn new(
        recipient: impl Into<String>,
        payload: impl Into<String>,
        correlation_ref: impl Into<String>,
        max_attempts: u32,
    ) -> DomainResult<Self> {
        let recipient = recipient.into();
        let payload = payload.into();

        if recipient.trim().is_empty() {
            return Err(DomainError::validation("recipient must not be empty"));
        }
        if payload.trim().is_empty() {
            return Err(DomainError::validation("payload must not be empty"));
        }
        if max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }

        let now = Utc::now();
        Ok(Self {
            id: JobId::new(),
            correlation_ref: correlation_ref.into(),
            recipient,
            payload,
            state: JobState::Pending,
            attempts: 0,
            max_attempts,
            last_error: String::new(),
            created_at: now,
            last_attempt_at: None,
            scheduled_for: now,
            claim_token: None,
        })
    }

    /// Schedule the job for later delivery.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = at;
        self
    }

    /// Schedule the job with a delay from its creation.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.scheduled_for = self.created_at + to_chrono(delay);
        self
    }

    /// Check if the job is eligible at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for <= now
    }

    /// Count a delivery attempt that is about to start.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        self.attempts += 1;
        self.last_attempt_at = Some(now);
    }

    /// Remember why the latest attempt failed.
    pub fn record_failure(&mut self, reason: impl Into<String>) {
        self.last_error = reason.into();
    }

    /// No attempts left: the next failure is terminal.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Snapshot of container sizes.
///
/// For dashboards only; never drive scheduling from it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub retry: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    /// Monotonic count of successful deliveries, unaffected by retention
    pub total_delivered: u64,
}

/// Millisecond score for a timestamp, rounded up so that a score `<= now`
/// never admits a job scheduled after `now`.
pub(crate) fn score_ms(at: DateTime<Utc>) -> i64 {
    let ms = at.timestamp_millis();
    if at.timestamp_subsec_nanos() % 1_000_000 == 0 {
        ms
    } else {
        ms + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    fn policy(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(3600), strategy)
    }

    #[test]
    fn quadratic_backoff_calculates_correctly() {
        let p = policy(BackoffStrategy::Quadratic);

        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(900));
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let p = policy(BackoffStrategy::Exponential);

        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(p.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let p = policy(BackoffStrategy::Linear);

        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn delay_is_capped() {
        let p = RetryPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(5),
            BackoffStrategy::Exponential,
        );
        assert_eq!(p.delay_for_attempt(10), Duration::from_secs(5));
        assert_eq!(p.delay_for_attempt(200), Duration::from_secs(5));
    }

    #[test]
    fn validate_rejects_cap_reached_too_early() {
        let p = RetryPolicy::new(
            Duration::from_secs(30),
            Duration::from_secs(60),
            BackoffStrategy::Quadratic,
        );
        assert!(p.validate(2).is_ok());
        assert!(p.validate(3).is_err());
        assert!(RetryPolicy::default().validate(3).is_ok());
    }

    #[test]
    fn validate_rejects_zero_base() {
        let p = RetryPolicy::new(Duration::ZERO, Duration::from_secs(1), BackoffStrategy::Linear);
        assert!(p.validate(3).is_err());
    }

    #[test]
    fn retention_requires_failed_to_outlive_completed() {
        assert!(RetentionPolicy::default().validate().is_ok());
        let bad = RetentionPolicy {
            completed: Duration::from_secs(10),
            failed: Duration::from_secs(10),
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn construction_validates_inputs() {
        assert!(JobRecord::new("", "hello", "order-1", 3).is_err());
        assert!(JobRecord::new("+254700000000", "  ", "order-1", 3).is_err());
        assert!(JobRecord::new("+254700000000", "hello", "order-1", 0).is_err());

        let job = JobRecord::new("+254700000000", "hello", "order-1", 3).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.last_error.is_empty());
        assert_eq!(job.scheduled_for, job.created_at);
        assert!(job.is_ready(Utc::now()));
    }

    #[test]
    fn delayed_job_is_not_ready_yet() {
        let job = JobRecord::new("+254700000000", "hello", "order-1", 3)
            .unwrap()
            .delayed(Duration::from_secs(60));
        assert!(!job.is_ready(job.created_at));
        assert!(job.is_ready(job.created_at + chrono::Duration::seconds(60)));
    }

    #[test]
    fn oversized_delay_is_clamped_not_dropped() {
        let job = JobRecord::new("+254700000000", "hello", "order-1", 3)
            .unwrap()
            .delayed(Duration::MAX);
        assert!(job.scheduled_for > job.created_at + chrono::Duration::days(365));
        assert!(!job.is_ready(Utc::now() + chrono::Duration::days(365)));
    }

    #[test]
    fn attempt_bookkeeping() {
        let mut job = JobRecord::new("+254700000000", "hello", "order-1", 2).unwrap();
        let now = Utc::now();

        job.begin_attempt(now);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_attempt_at, Some(now));
        assert!(!job.attempts_exhausted());

        job.record_failure("timeout");
        job.begin_attempt(now);
        assert!(job.attempts_exhausted());
        assert_eq!(job.last_error, "timeout");
    }

    #[test]
    fn serialized_record_omits_state_and_claim() {
        let mut job = JobRecord::new("+254700000000", "hello", "order-1", 2).unwrap();
        job.state = JobState::Processing;
        job.claim_token = Some(42);

        let json = serde_json::to_value(&job).unwrap();
        assert!(json.get("state").is_none());
        assert!(json.get("claim_token").is_none());

        let back: JobRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.state, JobState::Pending);
        assert_eq!(back.claim_token, None);
        assert_eq!(back.id, job.id);
    }

    #[test]
    fn score_rounds_sub_millisecond_up() {
        let at = DateTime::<Utc>::from_timestamp(1_700_000_000, 1_500_000).unwrap();
        assert_eq!(score_ms(at), 1_700_000_000_002);
        let exact = DateTime::<Utc>::from_timestamp(1_700_000_000, 2_000_000).unwrap();
        assert_eq!(score_ms(exact), 1_700_000_000_002);
    }

    proptest! {
        #[test]
        fn backoff_strictly_increases_below_cap(
            base_ms in 1u64..5_000,
            attempt in 1u32..20,
            strategy in prop_oneof![
                Just(BackoffStrategy::Quadratic),
                Just(BackoffStrategy::Exponential),
                Just(BackoffStrategy::Linear),
            ],
        ) {
            let p = RetryPolicy::new(
                Duration::from_millis(base_ms),
                Duration::from_secs(u64::MAX / 4_000),
                strategy,
            );
            let this = p.delay_for_attempt(attempt);
            let next = p.delay_for_attempt(attempt + 1);
            prop_assert!(this > Duration::ZERO);
            prop_assert!(next > this);
        }

        #[test]
        fn validated_policy_is_monotonic_for_every_retry(
            base_ms in 1u64..10_000,
            max_attempts in 2u32..10,
        ) {
            let p = RetryPolicy::new(
                Duration::from_millis(base_ms),
                Duration::from_millis(base_ms * 100),
                BackoffStrategy::Quadratic,
            );
            prop_assume!(p.validate(max_attempts).is_ok());
            for n in 1..max_attempts.saturating_sub(1) {
                prop_assert!(p.delay_for_attempt(n + 1) > p.delay_for_attempt(n));
            }
        }
    }
}
