use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

/// Broker and worker settings, read from `SLUICE_`-prefixed environment
/// variables. Unset fields fall back to the defaults returned by the
/// accessor methods.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,
    pub worker_threads: Option<usize>,
    pub prefetch_multiplier: Option<usize>,
    pub promoter_interval_ms: Option<u64>,
    pub idle_interval_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub consumer_timeout_ms: Option<u64>,
    /// Comma separated queue names the worker consumes. Empty means every
    /// queue declared by the registry.
    pub queues: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        Ok(envy::prefixed("SLUICE_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> &str {
        self.db_path.as_deref().unwrap_or("sluice.db")
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or(8).max(1)
    }

    pub fn prefetch_multiplier(&self) -> usize {
        self.prefetch_multiplier.unwrap_or(2).max(1)
    }

    /// Upper bound on the number of messages a worker pool holds claimed at
    /// once.
    pub fn prefetch_budget(&self) -> usize {
        self.worker_threads() * self.prefetch_multiplier()
    }

    pub fn promoter_interval(&self) -> Duration {
        Duration::from_millis(self.promoter_interval_ms.unwrap_or(100))
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms.unwrap_or(100))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.unwrap_or(1_000))
    }

    pub fn consumer_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer_timeout_ms.unwrap_or(60_000))
    }

    pub fn queues(&self) -> Vec<String> {
        self.queues
            .as_deref()
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|q| !q.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }
}
