//! Terminal failure reports.
//!
//! A message that can never run successfully (its actor is unknown, or its
//! retries are exhausted) is deleted and described by exactly one
//! [`FailureReport`]. Every rendered report contains [`FAILURE_MARKER`], so
//! log-based alerting can match on it.

use std::fmt;

use serde_json::{Map, Value};
use strum::AsRefStr;

use crate::message::Message;

/// Phrase present in every terminal failure report.
pub const FAILURE_MARKER: &str = "message failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    UnknownActor,
    RetriesExhausted,
}

#[derive(Debug, Clone)]
pub struct FailureReport {
    pub kind: FailureKind,
    pub message_id: String,
    pub queue: String,
    pub actor_name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    /// Executions that took place, including the last one.
    pub attempts: u32,
    /// Full error description, including the cause chain.
    pub error: String,
}

impl FailureReport {
    pub fn new(message: &Message, kind: FailureKind, attempts: u32, error: String) -> Self {
        Self {
            kind,
            message_id: message.id.clone(),
            queue: message.base_queue().to_owned(),
            actor_name: message.actor_name.clone(),
            args: message.args.0.clone(),
            kwargs: message.kwargs.0.clone(),
            attempts,
            error,
        }
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = Value::Array(self.args.clone());
        let kwargs = Value::Object(self.kwargs.clone());

        write!(
            f,
            "{}({args}, {kwargs}) {FAILURE_MARKER} ({}) after {} attempt(s) [message {} on {}]: {}",
            self.actor_name,
            self.kind.as_ref(),
            self.attempts,
            self.message_id,
            self.queue,
            self.error,
        )
    }
}

/// Receives terminal failure reports.
pub trait FailureReporter: Send + Sync + 'static {
    fn report(&self, report: &FailureReport);
}

/// Writes reports to the `tracing` error stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl FailureReporter for TracingReporter {
    fn report(&self, report: &FailureReport) {
        tracing::error!(
            message_id = %report.message_id,
            actor = %report.actor_name,
            kind = report.kind.as_ref(),
            "{report}"
        );
    }
}
