use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error};

use crate::config::PublisherConfig;
use crate::message::{MessageId, MessageProperties};

use super::backend::BackendChannel;
use super::errors::PublishError;
use super::telemetry::{Correlation, Operation, SharedTelemetry, Span};

/// Per-publish options; defaults come from [`PublisherConfig`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishOptions {
    /// Survive a broker restart (delivery mode 2).
    pub persistent: bool,
    /// Wait for the broker's confirm before returning.
    pub confirm: bool,
    /// Idempotency key; a UUID is generated when absent.
    pub message_id: Option<MessageId>,
    pub content_type: Option<String>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        PublishOptions::from(&PublisherConfig::default())
    }
}

impl From<&PublisherConfig> for PublishOptions {
    fn from(config: &PublisherConfig) -> Self {
        Self {
            persistent: config.persistent,
            confirm: config.confirm,
            message_id: None,
            content_type: None,
        }
    }
}

impl PublishOptions {
    pub fn with_message_id(mut self, id: impl Into<MessageId>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_confirm(mut self, confirm: bool) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }
}

/// Result of a successful publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    pub message_id: MessageId,
    /// False when the publish was sent without waiting for a confirm.
    pub confirmed: bool,
}

pub(crate) struct Publisher {
    queue: String,
    channel: Arc<dyn BackendChannel>,
    defaults: PublisherConfig,
    telemetry: SharedTelemetry,
}

impl Publisher {
    pub(crate) fn new(
        queue: &str,
        channel: Arc<dyn BackendChannel>,
        defaults: PublisherConfig,
        telemetry: SharedTelemetry,
    ) -> Self {
        Self {
            queue: queue.to_string(),
            channel,
            defaults,
            telemetry,
        }
    }

    pub(crate) fn default_options(&self) -> PublishOptions {
        PublishOptions::from(&self.defaults)
    }

    fn timeout(&self) -> Duration {
        self.defaults.publish_timeout()
    }

    pub(crate) async fn publish(
        &self,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<Ack, PublishError> {
        let message_id = options.message_id.unwrap_or_else(MessageId::generate);
        let properties = MessageProperties {
            message_id: Some(message_id.clone()),
            content_type: options.content_type,
            timestamp: u64::try_from(chrono::Utc::now().timestamp()).ok(),
            persistent: options.persistent,
        };
        let span = Span::start(
            &self.telemetry,
            Operation::Publish,
            Correlation {
                queue: self.queue.clone(),
                message_id: Some(message_id.clone()),
                delivery_tag: None,
            },
        );

        let result = self.send(payload, &properties, options.confirm).await;
        span.finish_with(&result);

        match result {
            Ok(confirmed) => {
                debug!(queue = %self.queue, message_id = %message_id, confirmed, "Published message");
                Ok(Ack {
                    message_id,
                    confirmed,
                })
            }
            Err(e) => {
                error!(queue = %self.queue, message_id = %message_id, "Publish failed: {}", e);
                Err(e)
            }
        }
    }

    async fn send(
        &self,
        payload: &[u8],
        properties: &MessageProperties,
        confirm: bool,
    ) -> Result<bool, PublishError> {
        let timeout = self.timeout();
        let round_trip = async {
            let pending = self.channel.publish(&self.queue, payload, properties).await?;
            if confirm {
                pending.await?;
            }
            Ok::<_, PublishError>(confirm)
        };

        tokio::time::timeout(timeout, round_trip)
            .await
            .map_err(|_| PublishError::Timeout(timeout))?
    }

    pub(crate) async fn publish_json<T: Serialize>(
        &self,
        message: &T,
        mut options: PublishOptions,
    ) -> Result<Ack, PublishError> {
        let payload = serde_json::to_vec(message)?;
        options
            .content_type
            .get_or_insert_with(|| "application/json".to_string());
        self.publish(&payload, options).await
    }
}
