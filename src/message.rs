//! Message types and queue naming.
//!
//! A message is one row in the `messages` table. Its `queue` column is the only
//! signal of visibility: a message in `Q` can be claimed by a consumer, a
//! message in `Q.DQ` (the delayed sub-queue of `Q`) cannot, and only the
//! promoter moves it back to `Q` once its eta has passed.
//!
//! # Message Lifecycle
//!
//! 1. A producer inserts the row into `Q`, or into `Q.DQ` with an eta when sent
//!    with a delay
//! 2. A consumer claims it by writing its token into `consumer_id`
//! 3. The executor either deletes it (success or terminal failure) or rewrites
//!    it into `Q.DQ` with a new eta and one fewer retry remaining

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{prelude::FromRow, types::Json};

use crate::error::Error;

/// Suffix appended to a queue name to form its delayed sub-queue.
pub const DELAY_SUFFIX: &str = ".DQ";

/// Queue used by actors that do not name one.
pub const DEFAULT_QUEUE: &str = "default";

pub fn delayed_queue_name(queue: &str) -> String {
    format!("{}{DELAY_SUFFIX}", base_queue_name(queue))
}

/// Strips the delay suffix, if any.
pub fn base_queue_name(queue: &str) -> &str {
    queue.strip_suffix(DELAY_SUFFIX).unwrap_or(queue)
}

pub fn is_delayed_queue(queue: &str) -> bool {
    queue.ends_with(DELAY_SUFFIX)
}

/// Checks that `queue` can be used as a base queue name.
pub fn validate_queue_name(queue: &str) -> Result<(), Error> {
    if queue.trim().is_empty() {
        return Err(Error::invalid_parameter("queue name must not be empty"));
    }
    if is_delayed_queue(queue) {
        return Err(Error::invalid_parameter(format!(
            "queue name {queue} must not end with {DELAY_SUFFIX}"
        )));
    }
    Ok(())
}

/// Per-message bookkeeping stored in the `options` column.
///
/// The backoff and time limit fields are overrides: when unset, the acting
/// actor's policy applies.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageOptions {
    /// Unix milliseconds before which the message must not run. Only
    /// meaningful while the message sits in a delayed sub-queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<i64>,
    /// Retry budget fixed when the message was sent.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub retries_remaining: u32,
    /// Failed executions so far.
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_backoff_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_ms: Option<u64>,
}

impl MessageOptions {
    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            retries_remaining: max_retries,
            ..Default::default()
        }
    }

    pub fn eta(&self) -> Option<DateTime<Utc>> {
        self.eta.and_then(DateTime::from_timestamp_millis)
    }
}

/// Call arguments handed to an actor.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Payload {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl Payload {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Deserializes the positional argument at `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> eyre::Result<T> {
        let value = self
            .args
            .get(index)
            .ok_or_else(|| eyre::eyre!("missing positional argument {index}"))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Deserializes the keyword argument `name`.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> eyre::Result<T> {
        let value = self
            .kwargs
            .get(name)
            .ok_or_else(|| eyre::eyre!("missing keyword argument {name}"))?;
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// A message row as stored in the database.
#[derive(Debug, Clone, FromRow)]
pub struct Message {
    pub id: String,
    pub queue: String,
    pub actor_name: String,
    pub args: Json<Vec<Value>>,
    pub kwargs: Json<Map<String, Value>>,
    pub options: Json<MessageOptions>,
    pub consumer_id: Option<String>,
    /// Unix milliseconds.
    pub created_at: i64,
}

impl Message {
    pub fn payload(&self) -> Payload {
        Payload::new(self.args.0.clone(), self.kwargs.0.clone())
    }

    pub fn options(&self) -> &MessageOptions {
        &self.options.0
    }

    pub fn base_queue(&self) -> &str {
        base_queue_name(&self.queue)
    }

    pub fn is_delayed(&self) -> bool {
        is_delayed_queue(&self.queue)
    }

    pub fn is_claimed(&self) -> bool {
        self.consumer_id.is_some()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.created_at)
    }
}
