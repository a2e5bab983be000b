use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Slack per attempt for process start-up and teardown around its own limit.
const ATTEMPT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    None,
    Fixed { ms: u64 },
    /// `base_ms * attempt` plus up to `jitter_ms` of random slack.
    Linear { base_ms: u64, jitter_ms: u64 },
}

/// Bounded-retry policy shared by every retrying component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    pub const fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Backoff::None)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { ms } => Duration::from_millis(ms),
            Backoff::Linear { base_ms, jitter_ms } => {
                let backoff = base_ms.saturating_mul(u64::from(attempt.max(1)));
                let jitter = if jitter_ms > 0 {
                    rand::thread_rng().gen_range(0..=jitter_ms)
                } else {
                    0
                };
                Duration::from_millis(backoff.max(10) + jitter)
            }
        }
    }

    /// Upper bound on a whole retrying call whose single attempts are each
    /// capped at `per_attempt`, including worst-case backoff between them.
    pub fn budget(&self, per_attempt: Duration) -> Duration {
        let attempts = self.max_attempts.max(1);
        let backoff: Duration = (1..attempts).map(|attempt| self.max_delay_for(attempt)).sum();
        (per_attempt + ATTEMPT_GRACE) * attempts + backoff
    }

    fn max_delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Linear { base_ms, jitter_ms } => {
                let backoff = base_ms.saturating_mul(u64::from(attempt.max(1)));
                Duration::from_millis(backoff.max(10) + jitter_ms)
            }
            _ => self.delay_for(attempt),
        }
    }

    pub async fn pause(&self, attempt: u32) {
        let delay = self.delay_for(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            3,
            Backoff::Linear {
                base_ms: 250,
                jitter_ms: 100,
            },
        )
    }
}
