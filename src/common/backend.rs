//! The capability set every broker backend provides.
//!
//! A backend is chosen when the [`ConnectionManager`](super::ConnectionManager)
//! is built; everything above this module (queue handles, the publisher, the
//! consumer and the ack controller) only talks to these traits.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::config::ConnectionConfig;
use crate::message::{DeliveryTag, MessageProperties, RawDelivery};

use super::address::BrokerAddress;
use super::errors::{BackendError, ConsumeError};

/// Deliveries pushed by the broker for one consumer.
pub type DeliveryStream = BoxStream<'static, Result<RawDelivery, ConsumeError>>;

/// Resolves once the broker confirmed (or refused) a publish.
pub type PendingConfirm = BoxFuture<'static, Result<(), BackendError>>;

/// Queue declaration parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    async fn open(
        &self,
        address: &BrokerAddress,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn BackendConnection>, BackendError>;
}

#[async_trait]
pub trait BackendConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn BackendChannel>, BackendError>;

    async fn close(&self) -> Result<(), BackendError>;
}

/// One multiplexed session. Implementations synchronize internally, so a
/// channel may be shared behind an `Arc`.
#[async_trait]
pub trait BackendChannel: Send + Sync {
    fn id(&self) -> String;

    fn is_open(&self) -> bool;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BackendError>;

    /// Sends a message through the default exchange to `queue`. The returned
    /// future resolves with the broker's confirm; dropping it is allowed.
    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<PendingConfirm, BackendError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, BackendError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BackendError>;

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BackendError>;

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BackendError>;

    async fn close(&self) -> Result<(), BackendError>;
}
