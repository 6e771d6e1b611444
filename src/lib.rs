use std::sync::Arc;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod actor;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod executor;
pub mod message;
pub mod promoter;
pub mod registry;
pub mod report;
pub mod retry;
pub mod store;
pub mod token;
pub mod worker;

pub use actor::{Actor, ActorPolicy};
pub use broker::{Broker, SendOptions};
pub use config::Config;
pub use error::Error;
pub use message::{Message, MessageOptions, Payload};
pub use registry::Registry;
pub use report::{FailureReport, FailureReporter, TracingReporter};
pub use store::Store;
pub use worker::Worker;

/// Returns a builder that boots a broker for `registry` and runs a worker
/// pool until ctrl-c.
#[bon::builder(finish_fn = start)]
pub async fn run(
    registry: Registry,
    #[builder(default = Arc::new(TracingReporter) as Arc<dyn FailureReporter>)] reporter: Arc<
        dyn FailureReporter,
    >,
) -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("SLUICE_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("SLUICE_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = Config::load()?;

    let broker = Broker::builder()
        .config(config)
        .registry(registry)
        .reporter(reporter)
        .build();

    broker.on_boot().await?;

    let worker = Worker::start(&broker).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    worker.stop().await;
    broker.on_shutdown().await;

    Ok(())
}
