//! Delayed-queue promoter.
//!
//! A single background loop per worker pool. Every poll interval it moves
//! due messages from each declared queue's `.DQ` sub-queue into the queue
//! itself, then hands back messages whose consumer stopped heartbeating. A
//! delayed message therefore runs no earlier than its eta and at most one
//! interval after it.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::{broker::DeclaredQueues, message::delayed_queue_name, store::Store};

/// Counters from one promoter pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub promoted: u64,
    pub released: u64,
}

pub struct Promoter {
    store: Store,
    queues: DeclaredQueues,
    interval: Duration,
    consumer_timeout: Duration,
    stop: CancellationToken,
}

impl Promoter {
    pub fn new(
        store: Store,
        queues: DeclaredQueues,
        interval: Duration,
        consumer_timeout: Duration,
        stop: CancellationToken,
    ) -> Self {
        Self {
            store,
            queues,
            interval,
            consumer_timeout,
            stop,
        }
    }

    #[tracing::instrument(name = "promoter", skip_all)]
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::debug!(interval = ?self.interval, "Promoter started");

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {
                    self.pass().await;
                }
            }
        }

        tracing::debug!("Promoter stopped");
    }

    /// Runs one promotion and orphan-recovery pass. Storage errors are logged
    /// and retried on the next pass.
    pub async fn pass(&self) -> PassStats {
        let mut stats = PassStats::default();
        let now = Utc::now();

        for queue in self.queues.snapshot() {
            let queue_dq = delayed_queue_name(&queue);

            match self.store.promote_ready(&queue_dq, now).await {
                Ok(0) => {}
                Ok(moved) => {
                    tracing::debug!(%queue, moved, "Promoted delayed messages");
                    stats.promoted += moved;
                }
                Err(e) => tracing::warn!(%queue, "Failed to promote delayed messages: {e}"),
            }
        }

        match self.store.release_orphaned(self.consumer_timeout).await {
            Ok(0) => {}
            Ok(released) => {
                tracing::warn!(released, "Released messages held by dead consumers");
                stats.released = released;
            }
            Err(e) => tracing::warn!("Failed to release orphaned messages: {e}"),
        }

        stats
    }
}
