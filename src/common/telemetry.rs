//! Instrumentation hook points.
//!
//! The client calls a [`TelemetryHook`] before and after each publish,
//! receive and ack/nack. Hooks observe only; nothing they do feeds back into
//! delivery decisions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::message::{DeliveryTag, MessageId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Publish,
    Receive,
    Ack,
    Nack,
    DeadLetter,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Publish => "publish",
            Operation::Receive => "receive",
            Operation::Ack => "ack",
            Operation::Nack => "nack",
            Operation::DeadLetter => "dead_letter",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Identifies the message an event is about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Correlation {
    pub queue: String,
    pub message_id: Option<MessageId>,
    pub delivery_tag: Option<DeliveryTag>,
}

pub trait TelemetryHook: Send + Sync {
    fn before(&self, _op: Operation, _correlation: &Correlation) {}

    fn after(
        &self,
        _op: Operation,
        _correlation: &Correlation,
        _elapsed: Duration,
        _outcome: Outcome,
    ) {
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Reports every hook point as a `tracing` event.
#[derive(Debug, Clone)]
pub struct TracingTelemetry {
    service_name: String,
}

impl TracingTelemetry {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }
}

impl TelemetryHook for TracingTelemetry {
    fn before(&self, op: Operation, correlation: &Correlation) {
        debug!(
            service = %self.service_name,
            op = %op,
            queue = %correlation.queue,
            message_id = ?correlation.message_id,
            delivery_tag = ?correlation.delivery_tag,
            "mq operation started"
        );
    }

    fn after(&self, op: Operation, correlation: &Correlation, elapsed: Duration, outcome: Outcome) {
        match outcome {
            Outcome::Success => debug!(
                service = %self.service_name,
                op = %op,
                queue = %correlation.queue,
                message_id = ?correlation.message_id,
                delivery_tag = ?correlation.delivery_tag,
                elapsed_ms = elapsed.as_millis() as u64,
                "mq operation finished"
            ),
            Outcome::Failure => warn!(
                service = %self.service_name,
                op = %op,
                queue = %correlation.queue,
                message_id = ?correlation.message_id,
                delivery_tag = ?correlation.delivery_tag,
                elapsed_ms = elapsed.as_millis() as u64,
                "mq operation failed"
            ),
        }
    }
}

pub type SharedTelemetry = Arc<dyn TelemetryHook>;

pub fn noop() -> SharedTelemetry {
    Arc::new(NoopTelemetry)
}

/// A started hook span; `finish` reports the matching `after`.
pub(crate) struct Span {
    hook: SharedTelemetry,
    op: Operation,
    correlation: Correlation,
    started: Instant,
}

impl Span {
    pub(crate) fn start(hook: &SharedTelemetry, op: Operation, correlation: Correlation) -> Self {
        hook.before(op, &correlation);
        Self {
            hook: Arc::clone(hook),
            op,
            correlation,
            started: Instant::now(),
        }
    }

    pub(crate) fn finish(self, outcome: Outcome) {
        self.hook
            .after(self.op, &self.correlation, self.started.elapsed(), outcome);
    }

    pub(crate) fn finish_with<T, E>(self, result: &Result<T, E>) {
        let outcome = if result.is_ok() { Outcome::Success } else { Outcome::Failure };
        self.finish(outcome);
    }
}
