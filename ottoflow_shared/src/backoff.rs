use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff curve with a cap and proportional jitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed, 0.0 disables jitter.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

fn default_initial_ms() -> u64 { 1_000 }
fn default_max_ms() -> u64 { 30_000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_jitter() -> f64 { 0.1 }

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self { initial_ms: ms, max_ms: ms, multiplier: 1.0, jitter: 0.0 }
    }

    /// Delay before attempt number `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let ms = (self.initial_ms as f64 * factor).min(self.max_ms as f64);
        Duration::from_millis(ms as u64)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = self.jitter.min(1.0);
        let factor = 1.0 + rand::rng().random_range(-spread..=spread);
        let ms = (base.as_millis() as f64 * factor).min(self.max_ms as f64).max(0.0);
        Duration::from_millis(ms as u64)
    }
}
