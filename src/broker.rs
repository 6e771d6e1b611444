use std::{
    collections::BTreeSet,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use serde_json::{Map, Value};
use tokio::sync::OnceCell;

use crate::{
    config::Config,
    error::Error,
    message::{validate_queue_name, MessageOptions, Payload},
    registry::Registry,
    report::{FailureReporter, TracingReporter},
    store::Store,
};

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Queue names known to a broker. The promoter walks the delayed sub-queue of
/// each of them.
#[derive(Debug, Clone, Default)]
pub struct DeclaredQueues(Arc<RwLock<BTreeSet<String>>>);

impl DeclaredQueues {
    /// Returns true if the queue was not declared before.
    pub fn declare(&self, queue: impl Into<String>) -> bool {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(queue.into())
    }

    pub fn contains(&self, queue: &str) -> bool {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(queue)
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Per-send overrides of an actor's defaults.
#[derive(Debug, Clone, Default, bon::Builder)]
pub struct SendOptions {
    /// Time before the message becomes visible to consumers.
    pub delay: Option<Duration>,
    #[builder(into)]
    pub queue_name: Option<String>,
    pub max_retries: Option<u32>,
    pub min_backoff: Option<Duration>,
    pub max_backoff: Option<Duration>,
    pub time_limit: Option<Duration>,
}

/// Entry point for producers and the worker pool.
///
/// A broker is inert until [`Broker::on_boot`] attaches it to the database.
/// Clones share the same store, registry and declared queues.
#[derive(Clone)]
pub struct Broker {
    config: Config,
    registry: Arc<Registry>,
    reporter: Arc<dyn FailureReporter>,
    store: Arc<OnceCell<Store>>,
    queues: DeclaredQueues,
}

#[bon::bon]
impl Broker {
    #[builder]
    pub fn new(
        #[builder(default)] config: Config,
        #[builder(into)] registry: Arc<Registry>,
        #[builder(default = Arc::new(TracingReporter) as Arc<dyn FailureReporter>)]
        reporter: Arc<dyn FailureReporter>,
    ) -> Self {
        let queues = DeclaredQueues::default();
        for queue in registry.queues() {
            queues.declare(queue);
        }

        Self {
            config,
            registry,
            reporter,
            store: Arc::new(OnceCell::new()),
            queues,
        }
    }
}

impl Broker {
    /// Connects to the database and runs migrations. Calling it again is a
    /// no-op.
    pub async fn on_boot(&self) -> Result<&Store, Error> {
        self.store
            .get_or_try_init(|| async {
                let store = Store::connect_with(&self.config).await?;
                tracing::info!(
                    db_path = self.config.db_path(),
                    actors = self.registry.len(),
                    "Broker booted"
                );
                Ok::<_, Error>(store)
            })
            .await
    }

    pub async fn on_shutdown(&self) {
        if let Some(store) = self.store.get() {
            store.close().await;
            tracing::info!("Broker shut down");
        }
    }

    pub fn store(&self) -> Result<&Store, Error> {
        self.store.get().ok_or(Error::NotBooted)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn reporter(&self) -> &Arc<dyn FailureReporter> {
        &self.reporter
    }

    pub fn declared_queues(&self) -> &DeclaredQueues {
        &self.queues
    }

    pub fn declare_queue(&self, queue: &str) -> Result<(), Error> {
        validate_queue_name(queue)?;

        if self.queues.declare(queue) {
            tracing::debug!(%queue, "Declared queue");
        }

        Ok(())
    }

    /// Sends a message with positional arguments only.
    pub async fn send(&self, actor_name: &str, args: Vec<Value>) -> Result<String, Error> {
        self.send_with_options(actor_name, args, Map::new(), SendOptions::default())
            .await
    }

    /// Sends a message to `actor_name`, applying per-message overrides.
    /// Returns the id of the new message.
    pub async fn send_with_options(
        &self,
        actor_name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: SendOptions,
    ) -> Result<String, Error> {
        let actor = self.registry.lookup(actor_name)?;

        let queue = options
            .queue_name
            .as_deref()
            .unwrap_or_else(|| actor.queue_name());
        self.declare_queue(queue)?;

        let max_retries = options.max_retries.unwrap_or(actor.policy().max_retries);
        let message_options = MessageOptions {
            min_backoff_ms: millis("min_backoff", options.min_backoff)?,
            max_backoff_ms: millis("max_backoff", options.max_backoff)?,
            time_limit_ms: millis("time_limit", options.time_limit)?,
            ..MessageOptions::with_retries(max_retries)
        };

        self.store()?
            .enqueue(
                queue,
                actor_name,
                &Payload::new(args, kwargs),
                message_options,
                options.delay,
            )
            .await
    }

    /// Waits until `queue` and its delayed sub-queue are empty.
    pub async fn join(&self, queue: &str, timeout: Duration) -> Result<(), Error> {
        let store = self.store()?;

        let wait = async {
            loop {
                if store.count(queue).await? == 0 {
                    return Ok::<(), Error>(());
                }
                tokio::time::sleep(JOIN_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::timeout(format!("queue {queue} to drain")))?
    }

    /// Deletes every message in `queue` and its delayed sub-queue.
    pub async fn flush(&self, queue: &str) -> Result<u64, Error> {
        self.store()?.flush(queue).await
    }

    pub async fn flush_all(&self) -> Result<u64, Error> {
        self.store()?.flush_all().await
    }
}

fn millis(name: &str, duration: Option<Duration>) -> Result<Option<u64>, Error> {
    duration
        .map(|d| {
            u64::try_from(d.as_millis())
                .map_err(|_| Error::invalid_parameter(format!("{name} {d:?} is out of range")))
        })
        .transpose()
}
