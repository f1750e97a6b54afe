use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::{ClientConfig, ConsumerConfig, DeadLetterPolicy};
use crate::message::{Message, MessageId};

use super::ack::{AckHandle, ControllerSettings};
use super::backend::{BackendChannel, BackendConnection, QueueSpec};
use super::consumer::MessageIterator;
use super::errors::{BackendError, ConsumeError, PublishError, QueueConflictError, QueueError};
use super::publisher::{Ack, PublishOptions, Publisher};
use super::retry::{RetryBudget, RetryLedger};
use super::telemetry::SharedTelemetry;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueOptions {
    pub name: String,
    pub durable: bool,
    pub dead_letter: DeadLetterPolicy,
}

impl QueueOptions {
    pub fn new(name: impl Into<String>, durable: bool) -> Self {
        Self {
            name: name.into(),
            durable,
            dead_letter: DeadLetterPolicy::default(),
        }
    }

    pub fn with_dead_letter(mut self, policy: DeadLetterPolicy) -> Self {
        self.dead_letter = policy;
        self
    }

    fn spec(&self) -> QueueSpec {
        let (dead_letter_exchange, dead_letter_routing_key) = match &self.dead_letter {
            DeadLetterPolicy::BrokerNative {
                exchange,
                routing_key,
            } => (Some(exchange.clone()), routing_key.clone()),
            _ => (None, None),
        };
        QueueSpec {
            name: self.name.clone(),
            durable: self.durable,
            dead_letter_exchange,
            dead_letter_routing_key,
        }
    }
}

/// One declared queue. Publishes go over the handle's own channel; each
/// consumer gets a fresh channel so prefetch is per consumer.
pub struct QueueHandle {
    options: QueueOptions,
    connection: Arc<dyn BackendConnection>,
    channel: Arc<dyn BackendChannel>,
    publisher: Publisher,
    config: Arc<ClientConfig>,
    ledger: Arc<RetryLedger>,
    telemetry: SharedTelemetry,
}

impl QueueHandle {
    pub(crate) async fn declare(
        connection: Arc<dyn BackendConnection>,
        options: QueueOptions,
        config: Arc<ClientConfig>,
        ledger: Arc<RetryLedger>,
        telemetry: SharedTelemetry,
    ) -> Result<Self, QueueError> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| QueueError::ChannelClosed(e.to_string()))?;

        channel
            .declare_queue(&options.spec())
            .await
            .map_err(|e| match e {
                BackendError::PreconditionFailed(reason) => QueueError::Conflict(QueueConflictError {
                    queue: options.name.clone(),
                    requested_durable: options.durable,
                    reason,
                }),
                other => QueueError::ChannelClosed(other.to_string()),
            })?;

        if let DeadLetterPolicy::FallbackQueue { queue } = &options.dead_letter {
            channel
                .declare_queue(&QueueSpec {
                    name: queue.clone(),
                    durable: options.durable,
                    ..QueueSpec::default()
                })
                .await
                .map_err(|e| QueueError::ChannelClosed(e.to_string()))?;
        }

        info!(queue = %options.name, durable = options.durable, channel_id = %channel.id(), "Queue declared");

        let publisher = Publisher::new(
            &options.name,
            Arc::clone(&channel),
            config.publisher.clone(),
            Arc::clone(&telemetry),
        );
        Ok(Self {
            options,
            connection,
            channel,
            publisher,
            config,
            ledger,
            telemetry,
        })
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn durable(&self) -> bool {
        self.options.durable
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    /// Retry budget on record for `id`, shared with every other handle of
    /// this queue on the same connection.
    pub fn retry_budget(&self, id: &MessageId) -> Option<RetryBudget> {
        self.ledger.budget(id)
    }

    /// Publishes with the configured defaults.
    pub async fn publish(&self, payload: impl AsRef<[u8]>) -> Result<Ack, PublishError> {
        self.publisher
            .publish(payload.as_ref(), self.publisher.default_options())
            .await
    }

    pub async fn publish_with(
        &self,
        payload: impl AsRef<[u8]>,
        options: PublishOptions,
    ) -> Result<Ack, PublishError> {
        self.publisher.publish(payload.as_ref(), options).await
    }

    pub async fn publish_json<T: Serialize>(&self, message: &T) -> Result<Ack, PublishError> {
        self.publisher
            .publish_json(message, self.publisher.default_options())
            .await
    }

    /// Starts a consumer with the configured deadline and `prefetch`.
    pub async fn consume(&self, prefetch: u16) -> Result<MessageIterator, ConsumeError> {
        let config = ConsumerConfig {
            prefetch,
            ..self.config.consumer.clone()
        };
        self.consume_with(&config).await
    }

    pub async fn consume_with(&self, config: &ConsumerConfig) -> Result<MessageIterator, ConsumeError> {
        let channel = self.connection.create_channel().await?;
        debug!(queue = %self.options.name, channel_id = %channel.id(), "Opened consumer channel");

        let settings = ControllerSettings {
            queue: self.options.name.clone(),
            ledger: Arc::clone(&self.ledger),
            dead_letter: self.options.dead_letter.clone(),
            processing_deadline: config.processing_deadline(),
            publish_timeout: self.config.publisher.publish_timeout(),
            telemetry: Arc::clone(&self.telemetry),
        };
        MessageIterator::start(channel, config, settings).await
    }

    /// Pulls one message, waiting up to `timeout` for it. `Ok(None)` when
    /// the queue stayed empty.
    ///
    /// The message is taken over a short-lived consumer; its channel closes
    /// once the returned handle is resolved.
    pub async fn get(&self, timeout: Duration) -> Result<Option<(Message, AckHandle)>, ConsumeError> {
        let config = ConsumerConfig {
            prefetch: 1,
            inactivity_timeout_ms: Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)),
            ..self.config.consumer.clone()
        };
        let mut messages = self.consume_with(&config).await?;
        let item = messages.next().await.transpose();
        // Nothing else may be delivered to this consumer.
        messages.stop_delivery().await;
        match &item {
            Ok(Some((message, _))) => debug!(queue = %self.options.name, message_id = %message.id(), "Got message"),
            Ok(None) => debug!(queue = %self.options.name, "No message within {:?}", timeout),
            Err(_) => {}
        }
        item
    }

    pub async fn close(self) -> Result<(), QueueError> {
        self.channel
            .close()
            .await
            .map_err(|e| QueueError::ChannelClosed(e.to_string()))
    }
}
