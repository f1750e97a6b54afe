//! Acknowledgment and retry controller.
//!
//! Every message handed to the application gets a slot that moves through
//! `Processing` into exactly one terminal state. The first resolution wins;
//! any later attempt (explicit or from the processing deadline) fails with
//! [`AckError::AlreadyResolved`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::DeadLetterPolicy;
use crate::message::{DeliveryTag, Message, MessageId, MessageProperties, RawDelivery};

use super::backend::BackendChannel;
use super::errors::{AckError, PublishError};
use super::retry::{Charge, RetryLedger};
use super::telemetry::{Correlation, Operation, SharedTelemetry, Span};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeliveryState {
    /// Received from the broker, not yet handed out.
    Delivered,
    Processing,
    Acked,
    Requeued,
    DeadLettered,
}

impl DeliveryState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, DeliveryState::Delivered | DeliveryState::Processing)
    }
}

/// How a delivery was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Acked,
    Requeued { attempt: u32, delay: Duration },
    DeadLettered { attempts: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureCause {
    RetriesExhausted,
    DeadlineExceeded,
    Rejected,
}

/// Emitted once per dead-lettered message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub queue: String,
    pub message_id: MessageId,
    pub delivery_tag: DeliveryTag,
    pub attempts: u32,
    pub cause: FailureCause,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Cause {
    Success,
    Failure,
    Deadline,
    Reject,
    Shutdown,
}

#[derive(Clone, Copy, Debug)]
enum Decision {
    Ack,
    Requeue { attempt: u32, delay: Duration },
    DeadLetter { attempts: u32, cause: FailureCause },
}

impl Decision {
    fn state(self) -> DeliveryState {
        match self {
            Decision::Ack => DeliveryState::Acked,
            Decision::Requeue { .. } => DeliveryState::Requeued,
            Decision::DeadLetter { .. } => DeliveryState::DeadLettered,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct Slot {
    tag: DeliveryTag,
    message_id: MessageId,
    state: Mutex<DeliveryState>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    deadline: Mutex<Option<JoinHandle<()>>>,
    /// Copy of the message, kept only when dead letters are republished.
    fallback: Option<(Vec<u8>, MessageProperties)>,
}

pub(crate) struct AckController {
    queue: String,
    channel: Arc<dyn BackendChannel>,
    ledger: Arc<RetryLedger>,
    dead_letter: DeadLetterPolicy,
    processing_deadline: Duration,
    publish_timeout: Duration,
    telemetry: SharedTelemetry,
    in_flight: Mutex<HashMap<DeliveryTag, Arc<Slot>>>,
    failures: mpsc::UnboundedSender<DeliveryFailure>,
}

pub(crate) struct ControllerSettings {
    pub queue: String,
    pub ledger: Arc<RetryLedger>,
    pub dead_letter: DeadLetterPolicy,
    pub processing_deadline: Duration,
    pub publish_timeout: Duration,
    pub telemetry: SharedTelemetry,
}

impl AckController {
    pub(crate) fn new(
        channel: Arc<dyn BackendChannel>,
        settings: ControllerSettings,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DeliveryFailure>) {
        let (failures, failure_rx) = mpsc::unbounded_channel();
        let controller = Arc::new(Self {
            queue: settings.queue,
            channel,
            ledger: settings.ledger,
            dead_letter: settings.dead_letter,
            processing_deadline: settings.processing_deadline,
            publish_timeout: settings.publish_timeout,
            telemetry: settings.telemetry,
            in_flight: Mutex::new(HashMap::new()),
            failures,
        });
        (controller, failure_rx)
    }

    fn correlation(&self, message_id: &MessageId, tag: DeliveryTag) -> Correlation {
        Correlation {
            queue: self.queue.clone(),
            message_id: Some(message_id.clone()),
            delivery_tag: Some(tag),
        }
    }

    /// Number of messages currently handed out and not yet settled with the broker.
    pub(crate) fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Moves a delivery into `Processing` and arms its processing deadline.
    pub(crate) fn begin(
        self: &Arc<Self>,
        raw: RawDelivery,
        permit: OwnedSemaphorePermit,
    ) -> (Message, AckHandle) {
        let fallback = match self.dead_letter {
            DeadLetterPolicy::FallbackQueue { .. } => {
                Some((raw.payload.clone(), raw.properties.clone()))
            }
            _ => None,
        };
        let message = Message::from_raw(raw);
        let slot = Arc::new(Slot {
            tag: message.delivery_tag(),
            message_id: message.id().clone(),
            state: Mutex::new(DeliveryState::Processing),
            permit: Mutex::new(Some(permit)),
            deadline: Mutex::new(None),
            fallback,
        });
        lock(&self.in_flight).insert(slot.tag, Arc::clone(&slot));

        let controller = Arc::clone(self);
        let timer_slot = Arc::clone(&slot);
        let deadline = self.processing_deadline;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            warn!(
                queue = %controller.queue,
                delivery_tag = %timer_slot.tag,
                "processing deadline of {:?} elapsed, requeueing",
                deadline
            );
            match controller.settle(&timer_slot, Cause::Deadline).await {
                Ok(resolution) => debug!(delivery_tag = %timer_slot.tag, ?resolution, "deadline resolution"),
                Err(AckError::AlreadyResolved { .. }) => {}
                Err(e) => error!(delivery_tag = %timer_slot.tag, "deadline resolution failed: {}", e),
            }
        });
        *lock(&slot.deadline) = Some(timer);

        let handle = AckHandle {
            slot,
            controller: Arc::clone(self),
        };
        (message, handle)
    }

    async fn settle(self: &Arc<Self>, slot: &Arc<Slot>, cause: Cause) -> Result<Resolution, AckError> {
        let decision = {
            let mut state = lock(&slot.state);
            if *state != DeliveryState::Processing {
                return Err(AckError::AlreadyResolved {
                    tag: slot.tag,
                    state: *state,
                });
            }
            let decision = self.decide(slot, cause);
            *state = decision.state();
            decision
        };

        let timer = lock(&slot.deadline).take();
        if let Some(timer) = timer {
            // The deadline task must not cancel itself mid-settle.
            if cause != Cause::Deadline {
                timer.abort();
            }
        }

        let result = match decision {
            Decision::Ack => {
                self.ledger.clear(&slot.message_id);
                self.send(slot, Operation::Ack, false)
                    .await
                    .map(|_| Resolution::Acked)
            }
            Decision::Requeue { attempt, delay } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                self.send(slot, Operation::Nack, true)
                    .await
                    .map(|_| Resolution::Requeued { attempt, delay })
            }
            Decision::DeadLetter { attempts, cause } => self.dead_letter(slot, attempts, cause).await,
        };

        self.release(slot);
        result
    }

    fn decide(&self, slot: &Slot, cause: Cause) -> Decision {
        let charged = |failure| match self.ledger.charge(&slot.message_id) {
            Charge::Requeue { attempt, delay } => Decision::Requeue { attempt, delay },
            Charge::Exhausted { attempts } => Decision::DeadLetter {
                attempts,
                cause: failure,
            },
        };

        match cause {
            Cause::Success => Decision::Ack,
            Cause::Failure => charged(FailureCause::RetriesExhausted),
            Cause::Deadline => charged(FailureCause::DeadlineExceeded),
            Cause::Reject => Decision::DeadLetter {
                attempts: self
                    .ledger
                    .budget(&slot.message_id)
                    .map_or(1, |budget| budget.attempts + 1),
                cause: FailureCause::Rejected,
            },
            Cause::Shutdown => Decision::Requeue {
                attempt: 0,
                delay: Duration::ZERO,
            },
        }
    }

    /// Sends ack (`op == Ack`) or nack to the broker, once.
    async fn send(&self, slot: &Slot, op: Operation, requeue: bool) -> Result<(), AckError> {
        let span = Span::start(&self.telemetry, op, self.correlation(&slot.message_id, slot.tag));
        let result = match op {
            Operation::Ack => self.channel.ack(slot.tag).await,
            _ => self.channel.nack(slot.tag, requeue).await,
        };
        span.finish_with(&result);

        result.map_err(|e| {
            error!(
                queue = %self.queue,
                delivery_tag = %slot.tag,
                "failed to send {} to broker: {}",
                op,
                e
            );
            AckError::ChannelClosed {
                tag: slot.tag,
                reason: e.to_string(),
            }
        })
    }

    async fn dead_letter(
        &self,
        slot: &Slot,
        attempts: u32,
        cause: FailureCause,
    ) -> Result<Resolution, AckError> {
        let span = Span::start(
            &self.telemetry,
            Operation::DeadLetter,
            self.correlation(&slot.message_id, slot.tag),
        );
        let result = match (&self.dead_letter, &slot.fallback) {
            (DeadLetterPolicy::FallbackQueue { queue }, Some((payload, properties))) => {
                match self.republish(queue, payload, properties).await {
                    Ok(()) => self.send(slot, Operation::Ack, false).await,
                    Err(source) => {
                        // Back on the source queue with a spent budget: the
                        // next failure dead-letters it straight away.
                        warn!(
                            queue = %self.queue,
                            message_id = %slot.message_id,
                            fallback = %queue,
                            "dead-letter publish failed, requeueing: {}",
                            source
                        );
                        *lock(&slot.state) = DeliveryState::Requeued;
                        self.ledger.exhaust(&slot.message_id, attempts);
                        if let Err(e) = self.send(slot, Operation::Nack, true).await {
                            error!(
                                delivery_tag = %slot.tag,
                                "requeue after failed dead-letter publish also failed: {}",
                                e
                            );
                        }
                        Err(AckError::DeadLetter {
                            tag: slot.tag,
                            source,
                        })
                    }
                }
            }
            _ => self.send(slot, Operation::Nack, false).await,
        };
        span.finish_with(&result);
        result?;

        self.ledger.clear(&slot.message_id);
        warn!(
            queue = %self.queue,
            message_id = %slot.message_id,
            delivery_tag = %slot.tag,
            attempts,
            ?cause,
            "message dead-lettered"
        );
        let _ = self.failures.send(DeliveryFailure {
            queue: self.queue.clone(),
            message_id: slot.message_id.clone(),
            delivery_tag: slot.tag,
            attempts,
            cause,
        });
        Ok(Resolution::DeadLettered { attempts })
    }

    async fn republish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), PublishError> {
        let pending = self.channel.publish(queue, payload, properties).await?;
        tokio::time::timeout(self.publish_timeout, pending)
            .await
            .map_err(|_| PublishError::Timeout(self.publish_timeout))??;
        Ok(())
    }

    fn release(&self, slot: &Slot) {
        lock(&self.in_flight).remove(&slot.tag);
        lock(&slot.permit).take();
    }

    /// Returns a delivery that was buffered but never handed out.
    pub(crate) async fn requeue_unyielded(&self, raw: &RawDelivery) {
        if let Err(e) = self.channel.nack(raw.delivery_tag, true).await {
            warn!(
                queue = %self.queue,
                delivery_tag = %raw.delivery_tag,
                "could not requeue buffered delivery: {}",
                e
            );
        }
    }

    /// Hard cancel: requeues every message still processing.
    pub(crate) async fn requeue_all_processing(self: &Arc<Self>) {
        let slots: Vec<Arc<Slot>> = lock(&self.in_flight).values().cloned().collect();
        for slot in slots {
            match self.settle(&slot, Cause::Shutdown).await {
                Ok(_) | Err(AckError::AlreadyResolved { .. }) => {}
                Err(e) => warn!(delivery_tag = %slot.tag, "requeue on abort failed: {}", e),
            }
        }
    }
}

/// Resolves one delivered message. Clones share the same delivery.
#[derive(Clone)]
pub struct AckHandle {
    slot: Arc<Slot>,
    controller: Arc<AckController>,
}

impl std::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckHandle")
            .field("delivery_tag", &self.slot.tag)
            .field("message_id", &self.slot.message_id)
            .field("state", &self.state())
            .finish()
    }
}

impl AckHandle {
    pub fn delivery_tag(&self) -> DeliveryTag {
        self.slot.tag
    }

    pub fn message_id(&self) -> &MessageId {
        &self.slot.message_id
    }

    pub fn state(&self) -> DeliveryState {
        *lock(&self.slot.state)
    }

    /// Processing succeeded.
    pub async fn ack(&self) -> Result<(), AckError> {
        self.controller
            .settle(&self.slot, Cause::Success)
            .await
            .map(|_| ())
    }

    /// Recoverable failure: requeue while the retry budget lasts.
    pub async fn nack(&self) -> Result<Resolution, AckError> {
        self.controller.settle(&self.slot, Cause::Failure).await
    }

    /// Unrecoverable failure: dead-letter without retrying.
    pub async fn reject(&self) -> Result<Resolution, AckError> {
        self.controller.settle(&self.slot, Cause::Reject).await
    }
}
