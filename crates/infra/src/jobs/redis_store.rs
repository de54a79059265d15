//! Redis-backed job queue (durable across restarts, shared by many workers).
//!
//! ## Key layout
//!
//! With the default prefix `courier:`:
//!
//! - `courier:pending`, `courier:retry`: sorted sets scored by eligibility time (ms)
//! - `courier:processing`: sorted set scored by claim time (ms); the score is the claim token
//! - `courier:completed`, `courier:failed`: sorted sets scored by resolution time (ms)
//! - `courier:job:{id}`: JSON job record
//! - `courier:stats:delivered`: monotonic delivered counter
//!
//! Jobs due in the same millisecond are claimed in id order. Ids are created
//! right before submission, so this matches insertion order for producers
//! that submit records as they build them.
//!
//! Every transition runs as one Lua script so no intermediate state is ever
//! visible to another worker. Active records never expire; terminal records
//! carry a TTL equal to their retention window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{error, instrument, warn};

use courier_core::JobId;
use courier_observability::{DispatchMetrics, NoopMetrics};

use super::store::{JobQueue, LEASE_EXPIRED_ERROR, QueueError, to_chrono};
use super::types::{JobRecord, JobState, QueueStats, RetentionPolicy, score_ms};

/// Default key prefix
pub const DEFAULT_KEY_PREFIX: &str = "courier:";

const SUBMIT_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX') then
  redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
  return 1
end
return 0
"#;

// KEYS: pending, retry, processing, failed. ARGV: now_ms, job key prefix.
const CLAIM_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
while true do
  local p = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now, 'WITHSCORES', 'LIMIT', 0, 1)
  local r = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now, 'WITHSCORES', 'LIMIT', 0, 1)
  if #p == 0 and #r == 0 then
    return false
  end
  local src, id
  if #r == 0 then
    src, id = KEYS[1], p[1]
  elseif #p == 0 then
    src, id = KEYS[2], r[1]
  else
    local ps, rs = tonumber(p[2]), tonumber(r[2])
    if ps < rs or (ps == rs and p[1] <= r[1]) then
      src, id = KEYS[1], p[1]
    else
      src, id = KEYS[2], r[1]
    end
  end
  redis.call('ZREM', src, id)
  local data = redis.call('GET', ARGV[2] .. id)
  if data then
    redis.call('ZADD', KEYS[3], now, id)
    return {id, data}
  end
  redis.call('ZADD', KEYS[4], now, id)
end
"#;

// KEYS: processing, job key. ARGV: id, token, data.
const RECORD_ATTEMPT_SCRIPT: &str = r#"
local held = redis.call('ZSCORE', KEYS[1], ARGV[1])
if (not held) or tonumber(held) ~= tonumber(ARGV[2]) then
  return 0
end
redis.call('SET', KEYS[2], ARGV[3])
return 1
"#;

// KEYS: processing, destination, job key, delivered counter.
// ARGV: id, token, destination score, data, ttl seconds (0 = none), count delivery.
const MOVE_SCRIPT: &str = r#"
local held = redis.call('ZSCORE', KEYS[1], ARGV[1])
if (not held) or tonumber(held) ~= tonumber(ARGV[2]) then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
if tonumber(ARGV[5]) > 0 then
  redis.call('SET', KEYS[3], ARGV[4], 'EX', ARGV[5])
else
  redis.call('SET', KEYS[3], ARGV[4])
end
if ARGV[6] == '1' then
  redis.call('INCR', KEYS[4])
end
return 1
"#;

// KEYS: processing, retry, failed.
// ARGV: cutoff_ms, now_ms, job key prefix, error, failed ttl seconds, now (RFC 3339).
const REQUEUE_STALE_SCRIPT: &str = r#"
local stale = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(stale) do
  redis.call('ZREM', KEYS[1], id)
  local key = ARGV[3] .. id
  local data = redis.call('GET', key)
  local exhausted = true
  if data then
    local ok, job = pcall(cjson.decode, data)
    if ok then
      job['last_error'] = ARGV[4]
      job['scheduled_for'] = ARGV[6]
      exhausted = (tonumber(job['attempts']) or 0) >= (tonumber(job['max_attempts']) or 0)
      data = cjson.encode(job)
    end
  end
  if exhausted then
    redis.call('ZADD', KEYS[3], ARGV[2], id)
    if data then
      redis.call('SET', key, data, 'EX', ARGV[5])
    end
  else
    redis.call('ZADD', KEYS[2], ARGV[2], id)
    redis.call('SET', key, data)
  end
end
return #stale
"#;

struct Scripts {
    submit: redis::Script,
    claim: redis::Script,
    record_attempt: redis::Script,
    transition: redis::Script,
    requeue_stale: redis::Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            submit: redis::Script::new(SUBMIT_SCRIPT),
            claim: redis::Script::new(CLAIM_SCRIPT),
            record_attempt: redis::Script::new(RECORD_ATTEMPT_SCRIPT),
            transition: redis::Script::new(MOVE_SCRIPT),
            requeue_stale: redis::Script::new(REQUEUE_STALE_SCRIPT),
        }
    }
}

/// Where a claimed job goes when it leaves Processing.
struct Transition<'a> {
    destination: &'a str,
    score: i64,
    ttl: Option<Duration>,
    count_delivery: bool,
}

#[derive(Clone)]
pub struct RedisJobQueue {
    client: Arc<redis::Client>,
    prefix: String,
    retention: RetentionPolicy,
    scripts: Arc<Scripts>,
    metrics: Arc<dyn DispatchMetrics>,
}

impl std::fmt::Debug for RedisJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobQueue")
            .field("prefix", &self.prefix)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

pub(crate) fn map_redis_err(e: redis::RedisError) -> QueueError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_timeout() || e.is_connection_dropped()
    {
        QueueError::Connection(e.to_string())
    } else {
        QueueError::Command(e.to_string())
    }
}

fn encode(job: &JobRecord) -> Result<String, QueueError> {
    serde_json::to_string(job).map_err(|e| QueueError::Serialization {
        job_id: job.id.to_string(),
        reason: e.to_string(),
    })
}

fn ttl_secs(ttl: Option<Duration>) -> u64 {
    // A TTL below one second would round to "no expiry".
    ttl.map(|d| d.as_secs().max(1)).unwrap_or(0)
}

impl RedisJobQueue {
    /// Create a new Redis job queue.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - Key prefix (default: "courier:")
    pub fn new(redis_url: impl AsRef<str>, prefix: Option<String>) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            prefix: prefix.unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            retention: RetentionPolicy::default(),
            scripts: Arc::new(Scripts::load()),
            metrics: Arc::new(NoopMetrics),
        })
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn DispatchMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Round-trip a PING to verify connectivity.
    pub fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let _: String = redis::cmd("PING").query(&mut conn).map_err(map_redis_err)?;
        Ok(())
    }

    fn conn(&self) -> Result<redis::Connection, QueueError> {
        self.client
            .get_connection()
            .map_err(|e| QueueError::Connection(e.to_string()))
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn job_prefix(&self) -> String {
        self.key("job:")
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}{}", self.job_prefix(), id)
    }

    fn transition(&self, job: &JobRecord, to: Transition<'_>) -> Result<(), QueueError> {
        let Some(token) = job.claim_token else {
            return Err(QueueError::NotClaimed(job.id));
        };
        let data = encode(job)?;
        let id = job.id.to_string();
        let mut conn = self.conn()?;

        let moved: i64 = self
            .scripts
            .transition
            .key(self.key("processing"))
            .key(self.key(to.destination))
            .key(self.job_key(&id))
            .key(self.key("stats:delivered"))
            .arg(&id)
            .arg(token)
            .arg(to.score)
            .arg(data)
            .arg(ttl_secs(to.ttl))
            .arg(if to.count_delivery { "1" } else { "0" })
            .invoke(&mut conn)
            .map_err(map_redis_err)?;

        if moved == 1 {
            Ok(())
        } else {
            Err(QueueError::NotClaimed(job.id))
        }
    }

    /// Park an unreadable claimed record in Failed so it is never claimed again.
    fn quarantine(&self, id: &str, token: i64, raw: String) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let _: i64 = self
            .scripts
            .transition
            .key(self.key("processing"))
            .key(self.key("failed"))
            .key(self.job_key(id))
            .key(self.key("stats:delivered"))
            .arg(id)
            .arg(token)
            .arg(token)
            .arg(raw)
            .arg(ttl_secs(Some(self.retention.failed)))
            .arg("0")
            .invoke(&mut conn)
            .map_err(map_redis_err)?;
        Ok(())
    }
}

impl JobQueue for RedisJobQueue {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    fn submit(&self, mut job: JobRecord) -> Result<JobId, QueueError> {
        job.state = JobState::Pending;
        job.claim_token = None;
        let data = encode(&job)?;
        let id = job.id.to_string();
        let mut conn = self.conn()?;

        let created: i64 = self
            .scripts
            .submit
            .key(self.job_key(&id))
            .key(self.key("pending"))
            .arg(data)
            .arg(score_ms(job.scheduled_for))
            .arg(&id)
            .invoke(&mut conn)
            .map_err(map_redis_err)?;

        if created == 0 {
            return Err(QueueError::AlreadyExists(job.id));
        }
        self.metrics.job_submitted();
        Ok(job.id)
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<JobRecord>, QueueError> {
        let token = now.timestamp_millis();
        let mut conn = self.conn()?;

        let claimed: Option<(String, String)> = self
            .scripts
            .claim
            .key(self.key("pending"))
            .key(self.key("retry"))
            .key(self.key("processing"))
            .key(self.key("failed"))
            .arg(token)
            .arg(self.job_prefix())
            .invoke(&mut conn)
            .map_err(map_redis_err)?;

        let Some((id, data)) = claimed else {
            return Ok(None);
        };

        match serde_json::from_str::<JobRecord>(&data) {
            Ok(mut job) => {
                job.state = JobState::Processing;
                job.claim_token = Some(token);
                Ok(Some(job))
            }
            Err(e) => {
                error!(
                    job_id = %id,
                    error = %e,
                    "claimed job record is unreadable, moving to failed"
                );
                self.quarantine(&id, token, data)?;
                Err(QueueError::Serialization {
                    job_id: id,
                    reason: e.to_string(),
                })
            }
        }
    }

    fn record_attempt(&self, job: &JobRecord) -> Result<(), QueueError> {
        let Some(token) = job.claim_token else {
            return Err(QueueError::NotClaimed(job.id));
        };
        let data = encode(job)?;
        let id = job.id.to_string();
        let mut conn = self.conn()?;

        let written: i64 = self
            .scripts
            .record_attempt
            .key(self.key("processing"))
            .key(self.job_key(&id))
            .arg(&id)
            .arg(token)
            .arg(data)
            .invoke(&mut conn)
            .map_err(map_redis_err)?;

        if written == 1 {
            Ok(())
        } else {
            Err(QueueError::NotClaimed(job.id))
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    fn complete(&self, job: &mut JobRecord, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.transition(
            job,
            Transition {
                destination: "completed",
                score: score_ms(now),
                ttl: Some(self.retention.completed),
                count_delivery: true,
            },
        )?;
        job.state = JobState::Completed;
        job.claim_token = None;
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    fn retry(
        &self,
        job: &mut JobRecord,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        if delay.is_zero() {
            return Err(QueueError::InvalidDelay);
        }
        let previous = job.scheduled_for;
        job.scheduled_for = now + to_chrono(delay);

        let moved = self.transition(
            job,
            Transition {
                destination: "retry",
                score: score_ms(job.scheduled_for),
                ttl: None,
                count_delivery: false,
            },
        );
        if let Err(e) = moved {
            job.scheduled_for = previous;
            return Err(e);
        }
        job.state = JobState::Retrying;
        job.claim_token = None;
        Ok(())
    }

    #[instrument(skip(self, job, error), fields(job_id = %job.id), err)]
    fn fail(&self, job: &mut JobRecord, error: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        let previous = std::mem::replace(&mut job.last_error, error.to_string());

        let moved = self.transition(
            job,
            Transition {
                destination: "failed",
                score: score_ms(now),
                ttl: Some(self.retention.failed),
                count_delivery: false,
            },
        );
        if let Err(e) = moved {
            job.last_error = previous;
            return Err(e);
        }
        job.state = JobState::Failed;
        job.claim_token = None;
        Ok(())
    }

    fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.conn()?;
        let (pending, retry, processing, completed, failed, delivered): (
            u64,
            u64,
            u64,
            u64,
            u64,
            Option<u64>,
        ) = redis::pipe()
            .atomic()
            .zcard(self.key("pending"))
            .zcard(self.key("retry"))
            .zcard(self.key("processing"))
            .zcard(self.key("completed"))
            .zcard(self.key("failed"))
            .get(self.key("stats:delivered"))
            .query(&mut conn)
            .map_err(map_redis_err)?;

        Ok(QueueStats {
            pending,
            retry,
            processing,
            completed,
            failed,
            total_delivered: delivered.unwrap_or(0),
        })
    }

    fn status_of(&self, id: JobId) -> Result<Option<JobState>, QueueError> {
        let member = id.to_string();
        let mut conn = self.conn()?;
        let scores: (
            Option<f64>,
            Option<f64>,
            Option<f64>,
            Option<f64>,
            Option<f64>,
        ) = redis::pipe()
            .atomic()
            .zscore(self.key("pending"), &member)
            .zscore(self.key("retry"), &member)
            .zscore(self.key("processing"), &member)
            .zscore(self.key("completed"), &member)
            .zscore(self.key("failed"), &member)
            .query(&mut conn)
            .map_err(map_redis_err)?;

        let state = match scores {
            (Some(_), ..) => Some(JobState::Pending),
            (_, Some(_), ..) => Some(JobState::Retrying),
            (_, _, Some(_), ..) => Some(JobState::Processing),
            (_, _, _, Some(_), _) => Some(JobState::Completed),
            (.., Some(_)) => Some(JobState::Failed),
            _ => None,
        };
        Ok(state)
    }

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        let Some(state) = self.status_of(id)? else {
            return Ok(None);
        };
        let mut conn = self.conn()?;
        let data: Option<String> = redis::cmd("GET")
            .arg(self.job_key(&id.to_string()))
            .query(&mut conn)
            .map_err(map_redis_err)?;

        let Some(data) = data else {
            return Ok(None);
        };
        let mut job: JobRecord =
            serde_json::from_str(&data).map_err(|e| QueueError::Serialization {
                job_id: id.to_string(),
                reason: e.to_string(),
            })?;
        job.state = state;
        Ok(Some(job))
    }

    fn requeue_stale(&self, now: DateTime<Utc>, lease: Duration) -> Result<usize, QueueError> {
        let cutoff = score_ms(now - to_chrono(lease));
        let mut conn = self.conn()?;

        let moved: usize = self
            .scripts
            .requeue_stale
            .key(self.key("processing"))
            .key(self.key("retry"))
            .key(self.key("failed"))
            .arg(cutoff)
            .arg(score_ms(now))
            .arg(self.job_prefix())
            .arg(LEASE_EXPIRED_ERROR)
            .arg(ttl_secs(Some(self.retention.failed)))
            .arg(now.to_rfc3339_opts(SecondsFormat::Millis, true))
            .invoke(&mut conn)
            .map_err(map_redis_err)?;

        if moved > 0 {
            warn!(count = moved, "requeued jobs with expired claim leases");
            self.metrics.jobs_requeued(moved);
        }
        Ok(moved)
    }

    fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let completed_cutoff = score_ms(now - to_chrono(self.retention.completed));
        let failed_cutoff = score_ms(now - to_chrono(self.retention.failed));
        let mut conn = self.conn()?;

        // Records expire on their own TTL; only the index entries need trimming.
        let (completed, failed): (usize, usize) = redis::pipe()
            .atomic()
            .zrembyscore(self.key("completed"), "-inf", completed_cutoff)
            .zrembyscore(self.key("failed"), "-inf", failed_cutoff)
            .query(&mut conn)
            .map_err(map_redis_err)?;

        Ok(completed + failed)
    }
}
