//! Polling consumer.
//!
//! Each consumer owns `prefetch` slots. The fetch half claims messages only
//! while it holds free slots, and every claimed message carries its slot to
//! the execute half, which gives it back once the message has been deleted or
//! requeued. A consumer therefore never holds more than `prefetch` claimed
//! messages, and a blocked actor cannot make it claim more work.

use std::{sync::Arc, time::Duration};

use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    OwnedSemaphorePermit, Semaphore,
};
use tokio_util::sync::CancellationToken;

use crate::{error::Error, executor::Executor, message::Message, store::Store, token};

struct Delivery {
    message: Message,
    _slot: OwnedSemaphorePermit,
}

pub struct Consumer {
    id: String,
    queues: Vec<String>,
    store: Store,
    executor: Executor,
    prefetch: usize,
    idle_interval: Duration,
    heartbeat_interval: Duration,
    stop: CancellationToken,
}

#[bon::bon]
impl Consumer {
    #[builder]
    pub fn new(
        queues: Vec<String>,
        store: Store,
        executor: Executor,
        #[builder(default = 2)] prefetch: usize,
        #[builder(default = Duration::from_millis(100))] idle_interval: Duration,
        #[builder(default = Duration::from_secs(1))] heartbeat_interval: Duration,
        stop: CancellationToken,
    ) -> Result<Self, Error> {
        Ok(Self {
            id: token::consumer_id()?,
            queues,
            store,
            executor,
            prefetch: prefetch.max(1),
            idle_interval,
            heartbeat_interval,
            stop,
        })
    }
}

impl Consumer {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Runs until the stop token fires, then finishes the message in hand,
    /// releases whatever it prefetched but did not start, and deregisters.
    #[tracing::instrument(name = "consumer", skip_all, fields(consumer = %self.id))]
    pub async fn run(self) {
        if !self.register().await {
            return;
        }

        tracing::debug!(queues = ?self.queues, prefetch = self.prefetch, "Consumer started");

        let slots = Arc::new(Semaphore::new(self.prefetch));
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Heartbeats continue until the execute half has drained, so a call
        // still running after stop is never mistaken for an orphan.
        let drained = CancellationToken::new();

        tokio::join!(
            self.fetch(slots, tx),
            async {
                self.execute(&mut rx).await;
                drained.cancel();
            },
            self.keep_alive(&drained)
        );

        rx.close();
        let mut pending = Vec::new();
        while let Ok(delivery) = rx.try_recv() {
            pending.push(delivery.message.id);
        }

        if !pending.is_empty() {
            match self.store.release(&pending, &self.id).await {
                Ok(released) => tracing::debug!(released, "Released prefetched messages"),
                Err(e) => tracing::warn!("Failed to release prefetched messages: {e}"),
            }
        }

        if let Err(e) = self.store.deregister(&self.id).await {
            tracing::warn!("Failed to deregister consumer: {e}");
        }

        tracing::debug!("Consumer stopped");
    }

    /// Writes the first heartbeat so that nothing this consumer claims is
    /// mistaken for an orphan. Returns false if stopped before succeeding.
    async fn register(&self) -> bool {
        loop {
            match self.store.heartbeat(&self.id).await {
                Ok(()) => return true,
                Err(e) => tracing::warn!("Failed to register consumer: {e}"),
            }

            if !self.idle().await {
                return false;
            }
        }
    }

    async fn keep_alive(&self, until: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = until.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.store.heartbeat(&self.id).await {
                        tracing::warn!("Consumer heartbeat failed: {e}");
                    }
                }
            }
        }
    }

    async fn fetch(&self, slots: Arc<Semaphore>, tx: UnboundedSender<Delivery>) {
        let mut offset = 0;

        loop {
            let first = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                slot = Arc::clone(&slots).acquire_owned() => match slot {
                    Ok(slot) => slot,
                    Err(_) => break,
                },
            };

            let mut free = vec![first];
            while let Ok(slot) = Arc::clone(&slots).try_acquire_owned() {
                free.push(slot);
            }

            let mut delivered = 0;
            let mut failed = false;

            // Rotate the starting queue so a busy queue cannot starve the rest.
            for i in 0..self.queues.len() {
                if free.is_empty() {
                    break;
                }

                let queue = &self.queues[(offset + i) % self.queues.len()];

                let claimed = match self.store.claim(queue, &self.id, free.len()).await {
                    Ok(claimed) => claimed,
                    Err(e) => {
                        tracing::warn!(%queue, "Failed to claim messages: {e}");
                        failed = true;
                        break;
                    }
                };

                for message in claimed {
                    let Some(slot) = free.pop() else {
                        break;
                    };

                    tracing::debug!(message_id = %message.id, %queue, "Claimed message");

                    if tx.send(Delivery { message, _slot: slot }).is_err() {
                        return;
                    }
                    delivered += 1;
                }
            }

            offset = offset.wrapping_add(1);
            drop(free);

            if (delivered == 0 || failed) && !self.idle().await {
                break;
            }
        }
    }

    async fn execute(&self, rx: &mut UnboundedReceiver<Delivery>) {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                delivery = rx.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            self.handle(delivery).await;
        }
    }

    async fn handle(&self, delivery: Delivery) {
        let Delivery { message, _slot } = delivery;
        let id = message.id.clone();

        match self.executor.process(message).await {
            Ok(outcome) => {
                tracing::debug!(message_id = %id, outcome = outcome.as_ref(), "Processed message");
            }
            Err(e) => {
                tracing::error!(message_id = %id, "Failed to settle message: {e}");

                // Hand it back so it is not stuck with this consumer.
                if let Err(e) = self.store.release(std::slice::from_ref(&id), &self.id).await {
                    tracing::warn!(message_id = %id, "Failed to release message: {e}");
                }
            }
        }
    }

    /// Sleeps for the idle interval. Returns false if stopped meanwhile.
    async fn idle(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(self.idle_interval) => true,
        }
    }
}
