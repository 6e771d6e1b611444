//! Actor definitions.
//!
//! An actor is a named callable plus the policy used when running it: the
//! queue its messages go to, how often a failing call is retried, the
//! bounds of the retry backoff, and an advisory time limit.

use std::{fmt, sync::Arc, time::Duration};

use crate::message::{Payload, DEFAULT_QUEUE};

pub const DEFAULT_MAX_RETRIES: u32 = 20;
pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_secs(15);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(10 * 60);

/// The code an actor runs. Returning `Err` (or panicking) marks the
/// execution as failed.
pub type ActorFn = Arc<dyn Fn(&Payload) -> eyre::Result<()> + Send + Sync + 'static>;

/// Execution policy attached to an actor.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
pub struct ActorPolicy {
    #[builder(into, default = DEFAULT_QUEUE.to_owned())]
    pub queue_name: String,
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,
    #[builder(default = DEFAULT_MIN_BACKOFF)]
    pub min_backoff: Duration,
    #[builder(default = DEFAULT_MAX_BACKOFF)]
    pub max_backoff: Duration,
    /// Calls running longer than this are reported but never interrupted.
    #[builder(default = DEFAULT_TIME_LIMIT)]
    pub time_limit: Duration,
}

impl Default for ActorPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Clone)]
pub struct Actor {
    name: String,
    policy: ActorPolicy,
    handler: ActorFn,
}

impl Actor {
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Payload) -> eyre::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            policy: ActorPolicy::default(),
            handler: Arc::new(handler),
        }
    }

    pub fn with_policy(mut self, policy: ActorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &ActorPolicy {
        &self.policy
    }

    pub fn queue_name(&self) -> &str {
        &self.policy.queue_name
    }

    pub fn handler(&self) -> ActorFn {
        Arc::clone(&self.handler)
    }
}

impl fmt::Debug for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actor")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
