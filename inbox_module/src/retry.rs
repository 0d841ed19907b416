//! Backoff schedules and the bounded retry used around contended writes.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use tracing::debug;

use crate::db::StoreError;

/// Delay growth between attempts. `attempt` is zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed {
        seconds: u64,
    },
    Exponential {
        base_seconds: u64,
        factor: u32,
        max_seconds: u64,
    },
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { seconds } => Duration::from_secs(seconds),
            Backoff::Exponential {
                base_seconds,
                factor,
                max_seconds,
            } => {
                let growth = u64::from(factor.max(1)).saturating_pow(attempt);
                Duration::from_secs(base_seconds.saturating_mul(growth).min(max_seconds))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentionPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ContentionPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 20,
            max_delay_ms: 1_000,
        }
    }
}

impl ContentionPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.max_delay_ms);
        let jitter = if self.base_delay_ms > 0 {
            rand::thread_rng().gen_range(0..=self.base_delay_ms)
        } else {
            0
        };
        Duration::from_millis(exp.saturating_add(jitter))
    }
}

/// Runs `op` again while it fails with a busy/locked/pool-timeout error,
/// sleeping with jittered exponential backoff. Other errors return at once.
pub fn retry_on_contention<T, F>(
    policy: &ContentionPolicy,
    label: &str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Result<T, StoreError>,
{
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_contention() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                debug!(
                    "{} hit storage contention attempt={} delay_ms={} err={}",
                    label,
                    attempt + 1,
                    delay.as_millis(),
                    err
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
