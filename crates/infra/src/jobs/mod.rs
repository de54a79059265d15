//! Durable notification job queue and its dispatch workers.
//!
//! ## Design
//!
//! - Every job lives in exactly one container: pending, processing, retry,
//!   completed or failed
//! - Container transitions are atomic in the store; workers coordinate only
//!   through it
//! - A claimed job carries a claim token; only its holder can resolve it
//! - Failed attempts are retried with growing backoff until `max_attempts`
//! - Stuck claims are handed back by a lease sweep
//!
//! ## Components
//!
//! - `JobRecord`: one outbound notification and its bookkeeping
//! - `JobQueue`: store abstraction (`InMemoryJobQueue`, `RedisJobQueue`)
//! - `DispatchWorker`: claims, delivers and resolves jobs on its own thread
//! - `NotificationService`: producer-facing submit and status API

#[cfg(feature = "redis")]
pub mod redis_store;
pub mod service;
pub mod store;
pub mod types;
pub mod worker;

#[cfg(feature = "redis")]
pub use redis_store::RedisJobQueue;
pub use service::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_ATTEMPTS_CEILING, NotificationService, SubmitError,
};
pub use store::{InMemoryJobQueue, JobQueue, QueueError};
pub use types::{
    BackoffStrategy, JobRecord, JobState, JobStatus, QueueStats, RetentionPolicy, RetryPolicy,
};
pub use worker::{
    DispatchWorker, DispatchWorkerConfig, DispatchWorkerHandle, JobOutcome, Resolution, Tick,
    WorkerStats,
};
