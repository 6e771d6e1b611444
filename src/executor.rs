//! Runs claimed messages and applies the retry policy.
//!
//! For every claimed message the executor either deletes the row (success,
//! unknown actor, or retries exhausted) or rewrites it into the delayed
//! sub-queue with a backoff eta. Errors raised by actors never escape; only
//! storage errors are returned to the caller.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use strum::AsRefStr;
use tokio::task::JoinError;

use crate::{
    error::Error,
    message::Message,
    registry::Registry,
    report::{FailureKind, FailureReport, FailureReporter},
    retry::{RetryDecision, RetryPolicy},
    store::Store,
};

/// What happened to a message after one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Outcome {
    /// The actor returned normally and the message was deleted.
    Succeeded,
    /// The actor failed and the message went back to its delayed sub-queue.
    Retried,
    /// The actor failed with no retries left; deleted and reported.
    Failed,
    /// No actor with that name is registered; deleted and reported.
    UnknownActor,
}

#[derive(Clone)]
pub struct Executor {
    store: Store,
    registry: Arc<Registry>,
    reporter: Arc<dyn FailureReporter>,
}

impl Executor {
    pub fn new(
        store: Store,
        registry: Arc<Registry>,
        reporter: Arc<dyn FailureReporter>,
    ) -> Self {
        Self {
            store,
            registry,
            reporter,
        }
    }

    pub async fn process(&self, message: Message) -> Result<Outcome, Error> {
        let Some(actor) = self.registry.get(&message.actor_name) else {
            self.store.delete(&message.id).await?;

            self.reporter.report(&FailureReport::new(
                &message,
                FailureKind::UnknownActor,
                0,
                format!(
                    "{} on queue {}; no retry policy applies, the message is dropped",
                    describe(&Error::unknown_actor(&message.actor_name)),
                    message.base_queue(),
                ),
            ));

            return Ok(Outcome::UnknownActor);
        };

        let time_limit = message
            .options()
            .time_limit_ms
            .map(Duration::from_millis)
            .unwrap_or(actor.policy().time_limit);

        tracing::debug!(
            message_id = %message.id,
            actor = %message.actor_name,
            "Running message"
        );

        let handler = actor.handler();
        let payload = message.payload();
        let mut task = tokio::task::spawn_blocking(move || handler(&payload));

        let joined = match tokio::time::timeout(time_limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!(
                    message_id = %message.id,
                    actor = %message.actor_name,
                    ?time_limit,
                    "Actor exceeded its time limit; waiting for it to finish"
                );
                task.await
            }
        };

        let err = match joined {
            Ok(Ok(())) => {
                self.store.delete(&message.id).await?;

                tracing::debug!(message_id = %message.id, "Message succeeded");

                return Ok(Outcome::Succeeded);
            }
            Ok(Err(err)) => err,
            Err(join_err) => panic_report(join_err),
        };

        let policy = RetryPolicy::resolve(actor.policy(), message.options());
        let decision = policy.decide(message.options().retries_remaining, rand::thread_rng());

        match decision {
            RetryDecision::Retry {
                attempt,
                retries_remaining,
                backoff,
            } => {
                let eta = retry_eta(Utc::now(), backoff);

                self.store
                    .requeue_delayed(&message.id, eta, retries_remaining)
                    .await?;

                tracing::warn!(
                    message_id = %message.id,
                    actor = %message.actor_name,
                    attempt,
                    retries_remaining,
                    ?backoff,
                    "Message failed, retrying: {err:#}"
                );

                Ok(Outcome::Retried)
            }
            RetryDecision::Exhausted { attempts } => {
                self.store.delete(&message.id).await?;

                let failure = Error::actor_failed(&message.actor_name, err);
                self.reporter.report(&FailureReport::new(
                    &message,
                    FailureKind::RetriesExhausted,
                    attempts,
                    describe(&failure),
                ));

                Ok(Outcome::Failed)
            }
        }
    }
}

/// `now + backoff`, saturating at the latest representable instant.
fn retry_eta(now: DateTime<Utc>, backoff: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(backoff)
        .ok()
        .and_then(|backoff| now.checked_add_signed(backoff))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Renders an error together with the full cause chain of the actor error
/// behind it.
fn describe(err: &Error) -> String {
    match err {
        Error::ActorExecutionFailure {
            source: Some(report),
            ..
        } => format!("{err}: {report:?}"),
        other => other.to_string(),
    }
}

fn panic_report(err: JoinError) -> eyre::Report {
    if !err.is_panic() {
        return eyre::eyre!("actor task was cancelled");
    }

    let panic = err.into_panic();
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned());

    eyre::eyre!("actor panicked: {detail}")
}
