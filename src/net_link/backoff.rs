use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectConfig;

/// Supplies the random part of a reconnect delay, given the upper bound.
pub type JitterSource = Box<dyn FnMut(Duration) -> Duration + Send + Sync>;

/// Uniform jitter in `[0, max]` at millisecond resolution.
pub fn random_jitter() -> JitterSource {
    Box::new(|max: Duration| {
        let max_ms = max.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub max_jitter: Duration,
    pub connect_timeout: Duration,
}

impl ReconnectPolicy {
    pub fn from_config(cfg: &ReconnectConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            max_attempts: cfg.max_attempts,
            max_jitter: Duration::from_millis(cfg.max_jitter_ms),
            connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
        }
    }

    /// Delay before reconnect number `attempt` (1-based): exponential in the
    /// attempt, plus jitter, never above `max_delay`.
    pub fn delay_for(&self, attempt: u32, jitter: Duration) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let backoff = self.base_delay.saturating_mul(1u32 << exponent);
        backoff.saturating_add(jitter).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}
