//! Worker pool: one promoter plus `worker_threads` consumers sharing a stop
//! token.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    broker::Broker, consumer::Consumer, error::Error, executor::Executor, promoter::Promoter,
};

pub struct Worker {
    stop: CancellationToken,
    queues: Vec<String>,
    consumer_ids: Vec<String>,
    handles: Vec<JoinHandle<()>>,
}

impl Worker {
    /// Boots the broker if needed and spawns the pool.
    ///
    /// Consumers listen on the configured queues, or on every queue the
    /// broker has declared when none are configured.
    pub async fn start(broker: &Broker) -> Result<Self, Error> {
        let store = broker.on_boot().await?.clone();
        let config = broker.config();

        let mut queues = config.queues();
        if queues.is_empty() {
            queues = broker.declared_queues().snapshot();
        }
        for queue in &queues {
            broker.declare_queue(queue)?;
        }
        if queues.is_empty() {
            return Err(Error::invalid_parameter("worker has no queues to consume"));
        }

        let executor = Executor::new(
            store.clone(),
            broker.registry().clone(),
            broker.reporter().clone(),
        );
        let stop = CancellationToken::new();

        let mut handles = Vec::with_capacity(config.worker_threads() + 1);
        let mut consumer_ids = Vec::with_capacity(config.worker_threads());

        let promoter = Promoter::new(
            store.clone(),
            broker.declared_queues().clone(),
            config.promoter_interval(),
            config.consumer_timeout(),
            stop.clone(),
        );
        handles.push(tokio::spawn(promoter.run()));

        for _ in 0..config.worker_threads() {
            let consumer = Consumer::builder()
                .queues(queues.clone())
                .store(store.clone())
                .executor(executor.clone())
                .prefetch(config.prefetch_multiplier())
                .idle_interval(config.idle_interval())
                .heartbeat_interval(config.heartbeat_interval())
                .stop(stop.clone())
                .build()?;

            consumer_ids.push(consumer.id().to_owned());
            handles.push(tokio::spawn(consumer.run()));
        }

        tracing::info!(
            ?queues,
            consumers = consumer_ids.len(),
            prefetch = config.prefetch_multiplier(),
            "Worker started"
        );

        Ok(Self {
            stop,
            queues,
            consumer_ids,
            handles,
        })
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    pub fn consumer_ids(&self) -> &[String] {
        &self.consumer_ids
    }

    /// Signals every task to stop and waits for them. Messages being executed
    /// finish first; prefetched ones go back to their queues.
    pub async fn stop(mut self) {
        self.stop.cancel();

        for handle in std::mem::take(&mut self.handles) {
            if let Err(e) = handle.await {
                tracing::error!("Worker task failed: {e}");
            }
        }

        tracing::info!("Worker stopped");
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
