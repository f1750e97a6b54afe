use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ConsumerConfig;
use crate::message::{Message, RawDelivery};

use super::ack::{AckController, AckHandle, ControllerSettings, DeliveryFailure};
use super::backend::BackendChannel;
use super::errors::ConsumeError;
use super::telemetry::{Correlation, Operation, Outcome, SharedTelemetry, Span};

/// A delivery waiting in the local buffer, with its open receive span.
struct Received {
    raw: RawDelivery,
    span: Span,
}

/// Wakes a suspended [`MessageIterator::next`] from another task.
#[derive(Clone)]
pub struct Canceller {
    signal: Arc<watch::Sender<bool>>,
}

impl Canceller {
    pub fn cancel(&self) {
        self.signal.send_replace(true);
    }
}

/// Lazy sequence of `(Message, AckHandle)` pairs from one queue.
///
/// Deliveries are pulled by a background task; `next` suspends until one is
/// available, while at most `prefetch` messages are unresolved. Dropping the
/// iterator (or a stream made from it) cancels the consumer and closes its
/// channel once every handed-out message is resolved.
pub struct MessageIterator {
    queue: String,
    consumer_tag: String,
    prefetch: u16,
    channel: Arc<dyn BackendChannel>,
    controller: Arc<AckController>,
    inbox: mpsc::Receiver<Result<Received, ConsumeError>>,
    pump: JoinHandle<()>,
    permits: Arc<Semaphore>,
    cancel: Arc<watch::Sender<bool>>,
    cancelled: watch::Receiver<bool>,
    failures: Option<mpsc::UnboundedReceiver<DeliveryFailure>>,
    inactivity_timeout: Option<Duration>,
    exhausted: bool,
    /// basic.cancel sent.
    shut_down: bool,
    /// Channel closed (or closing) by `close`/`abort`.
    released: bool,
}

async fn idle(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

impl MessageIterator {
    pub(crate) async fn start(
        channel: Arc<dyn BackendChannel>,
        config: &ConsumerConfig,
        settings: ControllerSettings,
    ) -> Result<Self, ConsumeError> {
        let queue = settings.queue.clone();
        let telemetry: SharedTelemetry = Arc::clone(&settings.telemetry);
        let prefetch = config.prefetch.max(1);
        let consumer_tag = format!("consumer-{}", Uuid::new_v4());

        let mut stream = channel.consume(&queue, &consumer_tag, prefetch).await?;
        info!(queue = %queue, consumer_tag = %consumer_tag, prefetch, "Started consuming");

        let (controller, failures) = AckController::new(Arc::clone(&channel), settings);
        let (tx, inbox) = mpsc::channel(usize::from(prefetch));

        let pump_queue = queue.clone();
        let pump = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let item = item.map(|raw| {
                    let correlation = Correlation {
                        queue: pump_queue.clone(),
                        message_id: raw.properties.message_id.clone(),
                        delivery_tag: Some(raw.delivery_tag),
                    };
                    let span = Span::start(&telemetry, Operation::Receive, correlation);
                    Received { raw, span }
                });
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
            debug!(queue = %pump_queue, "delivery stream ended");
        });

        let (cancel, cancelled) = watch::channel(false);

        Ok(Self {
            queue,
            consumer_tag,
            prefetch,
            channel,
            controller,
            inbox,
            pump,
            permits: Arc::new(Semaphore::new(usize::from(prefetch))),
            cancel: Arc::new(cancel),
            cancelled,
            failures: Some(failures),
            inactivity_timeout: config.inactivity_timeout(),
            exhausted: false,
            shut_down: false,
            released: false,
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn prefetch(&self) -> u16 {
        self.prefetch
    }

    /// Messages handed out and not yet resolved with the broker.
    pub fn outstanding(&self) -> usize {
        usize::from(self.prefetch) - self.permits.available_permits()
    }

    pub fn canceller(&self) -> Canceller {
        Canceller {
            signal: Arc::clone(&self.cancel),
        }
    }

    /// Receiver of dead-letter events. Can be taken once.
    pub fn failures(&mut self) -> Option<mpsc::UnboundedReceiver<DeliveryFailure>> {
        self.failures.take()
    }

    /// Next message, or `None` once the consumer is cancelled, the broker
    /// stopped delivering, or nothing arrived within the inactivity timeout.
    pub async fn next(&mut self) -> Option<Result<(Message, AckHandle), ConsumeError>> {
        if self.exhausted || *self.cancelled.borrow() {
            return None;
        }

        let mut cancelled = self.cancelled.clone();
        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok()?,
            _ = cancelled.wait_for(|cancelled| *cancelled) => return None,
        };

        let limit = self.inactivity_timeout;
        let item = tokio::select! {
            item = self.inbox.recv() => Some(item),
            _ = cancelled.wait_for(|cancelled| *cancelled) => return None,
            _ = idle(limit) => None,
        };
        let Some(item) = item else {
            info!(queue = %self.queue, consumer_tag = %self.consumer_tag, "No delivery for {:?}, ending consumer", limit);
            self.exhausted = true;
            return None;
        };

        match item {
            Some(Ok(received)) => {
                received.span.finish(Outcome::Success);
                Some(Ok(self.controller.begin(received.raw, permit)))
            }
            Some(Err(e)) => {
                warn!(queue = %self.queue, "consumer stopped: {}", e);
                self.exhausted = true;
                Some(Err(e))
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }

    /// Adapts the iterator into a `Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Result<(Message, AckHandle), ConsumeError>> {
        futures::stream::unfold(self, |mut iterator| async move {
            iterator.next().await.map(|item| (item, iterator))
        })
    }

    /// Stops new deliveries and returns the buffered ones to the queue.
    pub(crate) async fn stop_delivery(&mut self) {
        if self.shut_down {
            return;
        }
        self.cancel.send_replace(true);
        self.exhausted = true;
        self.shut_down = true;

        if let Err(e) = self.channel.cancel(&self.consumer_tag).await {
            warn!(consumer_tag = %self.consumer_tag, "basic.cancel failed: {}", e);
        }
        self.pump.abort();
        self.inbox.close();

        while let Some(item) = self.inbox.recv().await {
            if let Ok(received) = item {
                received.span.finish(Outcome::Failure);
                self.controller.requeue_unyielded(&received.raw).await;
            }
        }
    }

    async fn wait_until_settled(&self) {
        let _ = self.permits.acquire_many(u32::from(self.prefetch)).await;
    }

    /// Graceful shutdown: no new messages, in-flight ones finish first.
    pub async fn close(mut self) -> Result<(), ConsumeError> {
        info!(queue = %self.queue, consumer_tag = %self.consumer_tag, "Closing consumer");
        self.stop_delivery().await;
        self.wait_until_settled().await;
        self.released = true;
        self.channel.close().await?;
        Ok(())
    }

    /// Hard cancel: every message still processing is requeued now.
    pub async fn abort(mut self) -> Result<(), ConsumeError> {
        info!(queue = %self.queue, consumer_tag = %self.consumer_tag, "Aborting consumer");
        self.stop_delivery().await;
        self.controller.requeue_all_processing().await;
        self.wait_until_settled().await;
        self.released = true;
        self.channel.close().await?;
        Ok(())
    }
}

impl Drop for MessageIterator {
    fn drop(&mut self) {
        self.pump.abort();
        if self.released {
            return;
        }
        // Dropped without close(). Unyielded deliveries go back to the queue
        // when the channel closes.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let channel = Arc::clone(&self.channel);
            let consumer_tag = self.consumer_tag.clone();
            let cancel_consumer = !self.shut_down;
            let permits = Arc::clone(&self.permits);
            let prefetch = u32::from(self.prefetch);
            runtime.spawn(async move {
                if cancel_consumer {
                    if let Err(e) = channel.cancel(&consumer_tag).await {
                        debug!(consumer_tag = %consumer_tag, "cancel on drop failed: {}", e);
                    }
                }
                let _ = permits.acquire_many(prefetch).await;
                match channel.close().await {
                    Ok(()) => debug!(consumer_tag = %consumer_tag, "released dropped consumer's channel"),
                    Err(e) => debug!(consumer_tag = %consumer_tag, "closing channel on drop failed: {}", e),
                }
            });
        }
    }
}
