//! Typed configuration from environment variables.
//!
//! Read once at startup; invalid or missing values fail fast. In local dev,
//! call `dotenvy::dotenv().ok()` before [`Config::from_env`].

use core::fmt;
use core::str::FromStr;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use courier_observability::LogFormat;

use crate::gateway::DEFAULT_HTTP_TIMEOUT;
use crate::retry::{DEFAULT_STREAM_RETRY_INTERVAL, RetryPolicy};

pub const MODE: &str = "COURIER_MODE";
pub const REDIS_ADDR: &str = "REDIS_ADDR";
pub const GATEWAY_ADDR: &str = "GATEWAY_ADDR";
pub const BIND_ADDR: &str = "COURIER_BIND_ADDR";
pub const QUEUE_CAPACITY: &str = "COURIER_QUEUE_CAPACITY";
pub const RETRY_INTERVAL_MS: &str = "COURIER_RETRY_INTERVAL_MS";
pub const MAX_ATTEMPTS: &str = "COURIER_MAX_ATTEMPTS";
pub const CLAIM_IDLE_MS: &str = "COURIER_CLAIM_IDLE_MS";
pub const LOG_FORMAT: &str = "COURIER_LOG_FORMAT";
pub const HTTP_TIMEOUT_MS: &str = "COURIER_HTTP_TIMEOUT_MS";

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_QUEUE_CAPACITY: usize = 100;
const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(60);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Which delivery channel the service runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// One in-process bounded queue and a single worker.
    Queue,
    /// Redis Streams topics with one consumer group per downstream effect.
    #[default]
    Stream,
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(DeliveryMode::Queue),
            "stream" => Ok(DeliveryMode::Stream),
            _ => Err("expected \"queue\" or \"stream\"".to_string()),
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeliveryMode::Queue => "queue",
            DeliveryMode::Stream => "stream",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub mode: DeliveryMode,
    /// Required in stream mode.
    pub redis_addr: Option<String>,
    pub gateway_addr: String,
    pub bind_addr: SocketAddr,
    pub queue_capacity: usize,
    /// Overrides the per-mode default retry interval.
    pub retry_interval: Option<Duration>,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub claim_idle: Duration,
    pub log_format: LogFormat,
    pub http_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let mode: DeliveryMode = parse(MODE, var(MODE))?.unwrap_or_default();
        let redis_addr = var(REDIS_ADDR);
        if mode == DeliveryMode::Stream && redis_addr.is_none() {
            return Err(ConfigError::Missing(REDIS_ADDR));
        }
        let gateway_addr = var(GATEWAY_ADDR).ok_or(ConfigError::Missing(GATEWAY_ADDR))?;

        let bind_addr = match parse(BIND_ADDR, var(BIND_ADDR))? {
            Some(addr) => addr,
            None => parse(BIND_ADDR, Some(DEFAULT_BIND_ADDR.to_string()))?
                .ok_or(ConfigError::Missing(BIND_ADDR))?,
        };

        let queue_capacity: usize =
            parse(QUEUE_CAPACITY, var(QUEUE_CAPACITY))?.unwrap_or(DEFAULT_QUEUE_CAPACITY);
        if queue_capacity == 0 {
            return Err(invalid(QUEUE_CAPACITY, "0", "must be at least 1"));
        }

        let max_attempts: Option<u32> = parse(MAX_ATTEMPTS, var(MAX_ATTEMPTS))?;
        if max_attempts == Some(0) {
            return Err(invalid(MAX_ATTEMPTS, "0", "must be at least 1 (unset retries forever)"));
        }

        Ok(Self {
            mode,
            redis_addr,
            gateway_addr,
            bind_addr,
            queue_capacity,
            retry_interval: parse_millis(RETRY_INTERVAL_MS, var(RETRY_INTERVAL_MS))?,
            max_attempts,
            claim_idle: parse_millis(CLAIM_IDLE_MS, var(CLAIM_IDLE_MS))?
                .unwrap_or(DEFAULT_CLAIM_IDLE),
            log_format: parse(LOG_FORMAT, var(LOG_FORMAT))?.unwrap_or_default(),
            http_timeout: parse_millis(HTTP_TIMEOUT_MS, var(HTTP_TIMEOUT_MS))?
                .unwrap_or(DEFAULT_HTTP_TIMEOUT),
        })
    }

    /// In-process worker: immediate requeue unless an interval is configured.
    pub fn queue_retry_policy(&self) -> RetryPolicy {
        self.policy(Duration::ZERO)
    }

    /// Stream workers: nack then wait (1s unless configured).
    pub fn stream_retry_policy(&self) -> RetryPolicy {
        self.policy(DEFAULT_STREAM_RETRY_INTERVAL)
    }

    fn policy(&self, default_interval: Duration) -> RetryPolicy {
        let policy = RetryPolicy::fixed(self.retry_interval.unwrap_or(default_interval));
        match self.max_attempts {
            Some(max) => policy.with_max_attempts(max),
            None => policy,
        }
    }
}

fn invalid(var: &'static str, value: &str, reason: impl fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse<T>(var: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .map(|v| v.trim().parse::<T>().map_err(|e| invalid(var, &v, e)))
        .transpose()
}

fn parse_millis(var: &'static str, value: Option<String>) -> Result<Option<Duration>, ConfigError> {
    Ok(parse::<u64>(var, value)?.map(Duration::from_millis))
}
