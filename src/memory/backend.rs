use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::common::{
    Backend, BackendChannel, BackendConnection, BackendError, BrokerAddress, DeliveryStream,
    PendingConfirm, QueueSpec,
};
use crate::config::ConnectionConfig;
use crate::message::{DeliveryTag, MessageProperties};

use super::broker::MemoryBroker;

/// Backend that connects to an in-process [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryBackend {
    broker: MemoryBroker,
}

impl MemoryBackend {
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open(
        &self,
        address: &BrokerAddress,
        _config: &ConnectionConfig,
    ) -> Result<Arc<dyn BackendConnection>, BackendError> {
        let id = self.broker.open_connection(address.credentials())?;
        info!(connection_id = id, "Opened in-memory connection to {}", address);
        Ok(Arc::new(MemoryConnection {
            broker: self.broker.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BackendConnection for MemoryConnection {
    fn is_connected(&self) -> bool {
        self.broker.connection_open(self.id)
    }

    async fn create_channel(&self) -> Result<Arc<dyn BackendChannel>, BackendError> {
        let id = self.broker.open_channel(self.id)?;
        debug!(connection_id = self.id, channel_id = id, "Created in-memory channel");
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.broker.close_connection(self.id)
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BackendChannel for MemoryChannel {
    fn id(&self) -> String {
        format!("memory-{}", self.id)
    }

    fn is_open(&self) -> bool {
        self.broker.channel_open(self.id)
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BackendError> {
        self.broker.declare(self.id, spec)
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<PendingConfirm, BackendError> {
        self.broker.publish(self.id, queue, payload, properties)?;
        let delay = self.broker.confirm_delay();
        Ok(Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        }))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, BackendError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.broker
            .consume(self.id, queue, consumer_tag, prefetch, sender)?;
        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BackendError> {
        self.broker.cancel(self.id, consumer_tag)
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BackendError> {
        self.broker.ack(self.id, tag)
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BackendError> {
        self.broker.nack(self.id, tag, requeue)
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.broker.close_channel(self.id);
        Ok(())
    }
}
