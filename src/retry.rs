//! Retry policy: decides whether a failed message runs again and after how
//! long.

use std::time::Duration;

use rand::Rng;

use crate::{actor::ActorPolicy, message::MessageOptions};

/// Effective retry settings for one message: the actor's policy with the
/// message's own overrides applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

/// Outcome of a failed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run again after `backoff`, with `retries_remaining` retries left
    /// afterwards.
    Retry {
        attempt: u32,
        retries_remaining: u32,
        backoff: Duration,
    },
    /// No retries left.
    Exhausted { attempts: u32 },
}

impl RetryPolicy {
    pub fn resolve(actor: &ActorPolicy, options: &MessageOptions) -> Self {
        Self {
            max_retries: options.max_retries,
            min_backoff: options
                .min_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(actor.min_backoff),
            max_backoff: options
                .max_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(actor.max_backoff),
        }
    }

    /// Backoff ceiling before the `attempt`-th retry (1-indexed):
    /// `min_backoff * 2^(attempt - 1)`, capped at `max_backoff`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.min_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(Duration::MAX)
            .min(self.max_backoff)
    }

    /// Delay before the `attempt`-th retry: half the ceiling plus a random
    /// share of the other half.
    pub fn next_delay(&self, attempt: u32, mut rng: impl Rng) -> Duration {
        let ceiling = self.ceiling(attempt);
        let half = ceiling / 2;
        let jitter_ms = u64::try_from((ceiling - half).as_millis()).unwrap_or(u64::MAX);
        let jitter = Duration::from_millis(rng.gen_range(0..=jitter_ms));

        (half + jitter).min(ceiling)
    }

    /// Decides what happens after a failed execution of a message that had
    /// `retries_remaining` retries left.
    pub fn decide(&self, retries_remaining: u32, rng: impl Rng) -> RetryDecision {
        let attempts = self.max_retries.saturating_sub(retries_remaining) + 1;

        if retries_remaining == 0 {
            return RetryDecision::Exhausted { attempts };
        }

        let retries_remaining = retries_remaining - 1;
        let attempt = self.max_retries.saturating_sub(retries_remaining).max(1);

        RetryDecision::Retry {
            attempt,
            retries_remaining,
            backoff: self.next_delay(attempt, rng),
        }
    }
}
