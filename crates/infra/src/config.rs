//! Configuration loading and representation.
//!
//! Everything comes from environment variables with defaults; `from_lookup`
//! takes any key lookup so tests never touch the process environment.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::delivery::GatewayConfig;
use crate::jobs::{
    BackoffStrategy, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_ATTEMPTS_CEILING, DispatchWorkerConfig,
    RetentionPolicy, RetryPolicy,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Queue store selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    /// Use Redis instead of the in-process queue
    pub enabled: bool,
    pub url: String,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "redis://localhost:6379".to_string(),
            key_prefix: "courier:".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub count: usize,
    pub poll_interval: Duration,
    pub store_error_backoff: Duration,
    pub lease_timeout: Option<Duration>,
    pub sweep_interval: Duration,
    pub default_max_attempts: u32,
    /// Largest per-job attempt budget accepted at submission
    pub max_attempts_ceiling: u32,
    pub retry_policy: RetryPolicy,
    pub retry_rejections: bool,
    /// How long shutdown waits for in-flight sends
    pub shutdown_grace: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        let worker = DispatchWorkerConfig::default();
        Self {
            count: 1,
            poll_interval: worker.poll_interval,
            store_error_backoff: worker.store_error_backoff,
            lease_timeout: worker.lease_timeout,
            sweep_interval: worker.sweep_interval,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_attempts_ceiling: DEFAULT_MAX_ATTEMPTS_CEILING,
            retry_policy: worker.retry_policy,
            retry_rejections: worker.retry_rejections,
            shutdown_grace: Duration::from_secs(35),
        }
    }
}

impl WorkerSettings {
    /// Config for the `index`-th worker of this process.
    pub fn worker_config(&self, index: usize) -> DispatchWorkerConfig {
        DispatchWorkerConfig {
            name: format!("dispatch-worker-{index}"),
            poll_interval: self.poll_interval,
            store_error_backoff: self.store_error_backoff,
            lease_timeout: self.lease_timeout,
            sweep_interval: self.sweep_interval,
            retry_policy: self.retry_policy.clone(),
            retry_rejections: self.retry_rejections,
            ..DispatchWorkerConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourierConfig {
    pub redis: RedisConfig,
    pub gateway: GatewayConfig,
    pub worker: WorkerSettings,
    pub retention: RetentionPolicy,
    pub bind_addr: SocketAddr,
    /// `json` or `pretty`
    pub log_format: String,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            gateway: GatewayConfig::default(),
            worker: WorkerSettings::default(),
            retention: RetentionPolicy::default(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_format: "json".to_string(),
        }
    }
}

/// Typed reads over a key lookup.
struct Source<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Source<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::invalid(key, raw.clone(), e.to_string())),
        }
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::invalid(key, raw, "expected a boolean")),
            },
        }
    }

    fn secs(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_millis() as u64)
            .map(Duration::from_millis)
    }
}

impl CourierConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let src = Source { lookup };
        let d = Self::default();

        let redis = RedisConfig {
            enabled: src.flag("USE_PERSISTENT_STORES", d.redis.enabled)?,
            url: src.string("REDIS_URL", &d.redis.url),
            key_prefix: src.string("COURIER_KEY_PREFIX", &d.redis.key_prefix),
        };

        let sandbox = src.flag("SMS_IS_SANDBOX", d.gateway.sandbox)?;
        let gateway = GatewayConfig {
            username: src.string("SMS_USERNAME", &d.gateway.username),
            api_key: src.string("SMS_API_KEY", &d.gateway.api_key),
            shortcode: src.string("SMS_SHORTCODE", &d.gateway.shortcode),
            base_url: src.string("SMS_BASE_URL", GatewayConfig::default_base_url(sandbox)),
            timeout: src.secs("SMS_TIMEOUT_SECS", d.gateway.timeout)?,
            default_country_code: src
                .string("SMS_DEFAULT_COUNTRY_CODE", &d.gateway.default_country_code),
            sandbox,
        };

        let strategy = match src.get("RETRY_STRATEGY") {
            None => d.worker.retry_policy.strategy,
            Some(raw) => BackoffStrategy::parse(&raw).ok_or_else(|| {
                ConfigError::invalid(
                    "RETRY_STRATEGY",
                    raw,
                    "expected quadratic, exponential or linear",
                )
            })?,
        };
        let retry_policy = RetryPolicy::new(
            src.secs("RETRY_BASE_DELAY_SECS", d.worker.retry_policy.base_delay)?,
            src.secs("RETRY_MAX_DELAY_SECS", d.worker.retry_policy.max_delay)?,
            strategy,
        );

        let lease_secs = src.parse(
            "WORKER_LEASE_TIMEOUT_SECS",
            d.worker.lease_timeout.map(|l| l.as_secs()).unwrap_or(0),
        )?;

        let worker = WorkerSettings {
            count: src.parse("WORKER_COUNT", d.worker.count)?,
            poll_interval: src.millis("WORKER_POLL_INTERVAL_MS", d.worker.poll_interval)?,
            store_error_backoff: src
                .millis("WORKER_STORE_ERROR_BACKOFF_MS", d.worker.store_error_backoff)?,
            lease_timeout: (lease_secs > 0).then(|| Duration::from_secs(lease_secs)),
            sweep_interval: src.secs("WORKER_SWEEP_INTERVAL_SECS", d.worker.sweep_interval)?,
            default_max_attempts: src.parse("SMS_RETRY_LIMIT", d.worker.default_max_attempts)?,
            max_attempts_ceiling: src
                .parse("SMS_MAX_ATTEMPTS_CEILING", d.worker.max_attempts_ceiling)?,
            retry_policy,
            retry_rejections: src.flag("RETRY_REJECTIONS", d.worker.retry_rejections)?,
            shutdown_grace: src.secs("WORKER_SHUTDOWN_GRACE_SECS", d.worker.shutdown_grace)?,
        };

        let retention = RetentionPolicy {
            completed: src.secs("RETENTION_COMPLETED_SECS", d.retention.completed)?,
            failed: src.secs("RETENTION_FAILED_SECS", d.retention.failed)?,
        };

        let bind_addr = match src.get("BIND_ADDR") {
            Some(raw) => raw.trim().parse().map_err(|e: std::net::AddrParseError| {
                ConfigError::invalid("BIND_ADDR", raw.clone(), e.to_string())
            })?,
            None => SocketAddr::from(([0, 0, 0, 0], src.parse("PORT", d.bind_addr.port())?)),
        };

        let config = Self {
            redis,
            gateway,
            worker,
            retention,
            bind_addr,
            log_format: src.string("LOG_FORMAT", &d.log_format),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.worker;
        if w.count == 0 {
            return Err(ConfigError::invalid(
                "WORKER_COUNT",
                "0",
                "at least one worker is required",
            ));
        }
        if w.default_max_attempts == 0 {
            return Err(ConfigError::invalid("SMS_RETRY_LIMIT", "0", "must be at least 1"));
        }
        if w.default_max_attempts > w.max_attempts_ceiling {
            return Err(ConfigError::invalid(
                "SMS_RETRY_LIMIT",
                w.default_max_attempts.to_string(),
                format!("exceeds SMS_MAX_ATTEMPTS_CEILING ({})", w.max_attempts_ceiling),
            ));
        }
        if w.poll_interval.is_zero() {
            return Err(ConfigError::invalid("WORKER_POLL_INTERVAL_MS", "0", "must be positive"));
        }
        if let Some(lease) = w.lease_timeout {
            if lease <= self.gateway.timeout {
                return Err(ConfigError::invalid(
                    "WORKER_LEASE_TIMEOUT_SECS",
                    lease.as_secs().to_string(),
                    "must exceed the gateway timeout",
                ));
            }
        }
        // Every budget a producer may ask for must see strictly growing gaps.
        w.retry_policy
            .validate(w.max_attempts_ceiling)
            .map_err(|reason| {
                ConfigError::invalid(
                    "RETRY_MAX_DELAY_SECS",
                    w.retry_policy.max_delay.as_secs().to_string(),
                    reason,
                )
            })?;
        self.retention.validate().map_err(|reason| {
            ConfigError::invalid(
                "RETENTION_COMPLETED_SECS",
                self.retention.completed.as_secs().to_string(),
                reason,
            )
        })?;
        Ok(())
    }
}
