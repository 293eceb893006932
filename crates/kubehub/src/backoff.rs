use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Reconnect policy: bounded exponential backoff, optionally with jitter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// First delay (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for any delay (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Randomize each delay within `[d/2, d]`
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { base_delay_ms: default_base_delay_ms(), max_delay_ms: default_max_delay_ms(), jitter: default_jitter() }
    }
}

fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_jitter() -> bool {
    true
}

/// Running state of a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self { Self { policy, attempt: 0 } }

    pub fn attempt(&self) -> u32 { self.attempt }

    /// Delay before the next retry; grows until `max_delay_ms`.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u64 << self.attempt.min(20);
        let ceiling = self.policy.base_delay_ms.saturating_mul(factor).min(self.policy.max_delay_ms);
        self.attempt = self.attempt.saturating_add(1);
        let ms = if self.policy.jitter && ceiling > 1 {
            let half = ceiling / 2;
            half + rand::thread_rng().gen_range(0..=ceiling - half)
        } else {
            ceiling
        };
        Duration::from_millis(ms)
    }

    pub fn reset(&mut self) { self.attempt = 0; }
}
