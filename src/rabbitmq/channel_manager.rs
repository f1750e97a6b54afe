use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel};
use tracing::{debug, info};

use crate::common::{
    BackendChannel, BackendError, ConsumeError, DeliveryStream, PendingConfirm, QueueSpec,
};
use crate::message::{DeliveryTag, MessageId, MessageProperties, RawDelivery};

const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// One lapin channel behind the backend channel contract.
pub struct RabbitMqChannel {
    channel: Channel,
    id: String,
}

impl RabbitMqChannel {
    pub fn new(channel: Channel) -> Self {
        let id = format!("channel-{}", channel.id());
        Self { channel, id }
    }
}

fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(exchange) = &spec.dead_letter_exchange {
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.as_str().into()),
        );
    }
    if let Some(routing_key) = &spec.dead_letter_routing_key {
        arguments.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(routing_key.as_str().into()),
        );
    }
    arguments
}

fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(id) = &properties.message_id {
        basic = basic.with_message_id(id.as_str().into());
    }
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(content_type.as_str().into());
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    if properties.persistent {
        basic = basic.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    basic
}

fn raw_delivery(delivery: Delivery) -> RawDelivery {
    let properties = MessageProperties {
        message_id: delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| MessageId::new(id.as_str())),
        content_type: delivery
            .properties
            .content_type()
            .as_ref()
            .map(|content_type| content_type.as_str().to_string()),
        timestamp: *delivery.properties.timestamp(),
        persistent: *delivery.properties.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
    };

    RawDelivery {
        delivery_tag: DeliveryTag(delivery.delivery_tag),
        redelivered: delivery.redelivered,
        payload: delivery.data,
        properties,
    }
}

#[async_trait]
impl BackendChannel for RabbitMqChannel {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BackendError> {
        info!(channel_id = %self.id, "About to declare queue: {}", spec.name);
        let queue = self
            .channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(spec),
            )
            .await?;
        debug!(
            "Queue '{}' declared with {} messages",
            spec.name,
            queue.message_count()
        );
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<PendingConfirm, BackendError> {
        // mandatory: unroutable messages come back instead of vanishing
        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                payload,
                basic_properties(properties),
            )
            .await?;

        Ok(Box::pin(async move {
            match confirm.await? {
                Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
                Confirmation::Ack(Some(returned)) => Err(BackendError::Rejected(format!(
                    "message returned by broker: {} {}",
                    returned.reply_code,
                    returned.reply_text.as_str()
                ))),
                Confirmation::Nack(_) => {
                    Err(BackendError::Rejected("broker nacked the publish".to_string()))
                }
            }
        }))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, BackendError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let stream = consumer
            .map(|delivery| {
                delivery
                    .map(raw_delivery)
                    .map_err(|e| ConsumeError::from(BackendError::from(e)))
            })
            .boxed();
        Ok(stream)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BackendError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BackendError> {
        self.channel
            .basic_ack(tag.0, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BackendError> {
        self.channel
            .basic_nack(
                tag.0,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        if self.channel.status().connected() {
            self.channel.close(200, "Closing channel").await?;
        }
        Ok(())
    }
}
