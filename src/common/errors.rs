use std::time::Duration;

use thiserror::Error;

use crate::message::DeliveryTag;

use super::ack::DeliveryState;

/// Failure reported by a backend. The core maps it onto the typed errors
/// below, per operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Network-level failure: DNS, refused, reset, timeout.
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// The broker refused the request (credentials, vhost, routing).
    #[error("broker rejected request: {0}")]
    Rejected(String),

    /// A declare did not match the existing entity.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unreachable(_) | BackendError::ChannelClosed(_))
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("broker rejected connection: {0}")]
    Rejected(String),

    #[error("gave up connecting after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("no open connection")]
    NotConnected,

    #[error("closing connection failed: {0}")]
    CloseFailed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("queue '{queue}' already exists with different settings (requested durable={requested_durable}): {reason}")]
pub struct QueueConflictError {
    pub queue: String,
    pub requested_durable: bool,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Conflict(#[from] QueueConflictError),

    #[error("channel closed while declaring queue: {0}")]
    ChannelClosed(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Debug, Error)]
pub enum PublishError {
    /// Connection dropped mid-send; retry on a fresh queue handle.
    #[error("channel closed during publish: {0}")]
    ChannelClosed(String),

    /// Broker-side routing failure or negative confirm. Never retried here.
    #[error("broker rejected publish: {0}")]
    Rejected(String),

    #[error("publish not confirmed within {0:?}")]
    Timeout(Duration),

    #[error("message serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsumeError {
    #[error("channel closed while consuming: {0}")]
    ChannelClosed(String),
}

#[derive(Debug, Error)]
pub enum AckError {
    #[error("delivery {tag} already resolved as {state:?}")]
    AlreadyResolved { tag: DeliveryTag, state: DeliveryState },

    /// The ack/nack never reached the broker. The broker redelivers the
    /// message on its own; it is not resent.
    #[error("channel closed while resolving delivery {tag}: {reason}")]
    ChannelClosed { tag: DeliveryTag, reason: String },

    #[error("dead-letter publish for delivery {tag} failed: {source}")]
    DeadLetter {
        tag: DeliveryTag,
        #[source]
        source: PublishError,
    },
}

impl From<BackendError> for ConsumeError {
    fn from(error: BackendError) -> Self {
        ConsumeError::ChannelClosed(error.to_string())
    }
}

impl From<BackendError> for PublishError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::Rejected(reason) | BackendError::PreconditionFailed(reason) => {
                PublishError::Rejected(reason)
            }
            BackendError::Unreachable(reason) | BackendError::ChannelClosed(reason) => {
                PublishError::ChannelClosed(reason)
            }
        }
    }
}

/// Umbrella error for callers that don't care which operation failed.
#[derive(Debug, Error)]
pub enum MqError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Consume(#[from] ConsumeError),

    #[error(transparent)]
    Ack(#[from] AckError),
}

// Custom Result type for client operations
pub type Result<T> = std::result::Result<T, MqError>;
