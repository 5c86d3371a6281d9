//! Reconnect policies.
//!
//! The connection task never decides on its own whether to reconnect after
//! losing the broker. It asks its [`ReconnectPolicy`] for a delay, and a
//! `None` answer ends the task.

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::time::Duration;

use crate::config::ReconnectSettings;
use crate::utils::error::Error;

pub trait ReconnectPolicy: Send + 'static {
    /// Delay before reconnect attempt number `attempt` (starting at 1), or
    /// `None` to give up. `cause` is what ended the previous connection.
    fn next_delay(&mut self, attempt: u32, cause: &Error) -> Option<Duration>;
}

/// Never reconnects.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReconnect;

impl ReconnectPolicy for NoReconnect {
    fn next_delay(&mut self, _attempt: u32, _cause: &Error) -> Option<Duration> {
        None
    }
}

/// Exponential backoff with ±25% jitter, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    max_attempts: Option<u32>,
    jitter: bool,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
            max_attempts: None,
            jitter: true,
        }
    }

    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            multiplier: settings.multiplier.max(1.0),
            max_attempts: settings.max_attempts,
            jitter: true,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before `attempt`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        Duration::from_secs_f64(if secs.is_finite() { secs.min(max) } else { max })
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_delay(&mut self, attempt: u32, cause: &Error) -> Option<Duration> {
        if cause.is_fatal() {
            return None;
        }
        if self.max_attempts.is_some_and(|max| attempt > max) {
            return None;
        }
        let delay = self.base_delay(attempt);
        Some(if self.jitter { apply_jitter(delay) } else { delay })
    }
}

/// The policy described by `settings`.
pub fn from_settings(settings: &ReconnectSettings) -> Box<dyn ReconnectPolicy> {
    if settings.enabled {
        Box::new(ExponentialBackoff::from_settings(settings))
    } else {
        Box::new(NoReconnect)
    }
}

fn apply_jitter(delay: Duration) -> Duration {
    let hash = RandomState::new().hash_one(std::time::SystemTime::now());
    let random_factor = (hash % 1000) as f64 / 1000.0;
    Duration::from_secs_f64(delay.as_secs_f64() * (0.75 + random_factor * 0.5))
}
