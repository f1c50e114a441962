//! Retry policy for failed deliveries.
//!
//! Workers never back off: every retry waits the same fixed interval. The
//! in-process worker defaults to no wait at all (the task goes straight back
//! to the tail of its queue); stream workers wait one second after a nack.

use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// Wait applied after a nack when nothing else is configured.
pub const DEFAULT_STREAM_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Fixed delay after each failed attempt.
    pub interval: Duration,
    /// Total attempts allowed (first try included). `None` retries forever.
    pub max_attempts: Option<u32>,
}

/// What a worker does after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { after: Duration },
    GiveUp,
}

impl RetryPolicy {
    /// Re-submit immediately, forever.
    pub fn immediate() -> Self {
        Self {
            interval: Duration::ZERO,
            max_attempts: None,
        }
    }

    /// Wait `interval` between attempts, forever.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    /// Policy used by stream workers (1s, no ceiling).
    pub fn stream_default() -> Self {
        Self::fixed(DEFAULT_STREAM_RETRY_INTERVAL)
    }

    /// Cap total attempts. A cap of zero is treated as one.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    /// Decide after `attempt` (1-indexed) has failed.
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        match self.max_attempts {
            Some(max) if attempt >= max => RetryDecision::GiveUp,
            _ => RetryDecision::Retry {
                after: self.interval,
            },
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::immediate()
    }
}

/// Blocking pause between attempts.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Real sleeper (`std::thread::sleep`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Sleeper that returns immediately and remembers every requested pause.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn total(&self) -> Duration {
        self.sleeps().iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.slept
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
    }
}
