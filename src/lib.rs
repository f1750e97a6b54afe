//! Message-queue client with a RabbitMQ backend.
//!
//! A [`ConnectionManager`] owns the broker session; queues declared on it
//! hand out publishers and consumers. Consumers are lazy iterators yielding
//! `(Message, AckHandle)` pairs, and every handle must be resolved exactly
//! once with `ack`, `nack` or `reject`.

pub mod common;
pub mod config;
pub mod env;
pub mod memory;
pub mod message;
pub mod rabbitmq;

pub use common::{
    Ack, AckError, AckHandle, Backend, BrokerAddress, Canceller, Connection, ConnectionError,
    ConnectionManager, ConsumeError, DeliveryFailure, DeliveryState, FailureCause,
    MessageIterator, MqError, NoopTelemetry, PublishError, PublishOptions, QueueConflictError,
    QueueError, QueueHandle, QueueOptions, Resolution, Result, TelemetryHook, TracingTelemetry,
};
pub use config::{ClientConfig, ConsumerConfig, DeadLetterPolicy, RetryPolicy};
pub use memory::{MemoryBackend, MemoryBroker};
pub use message::{DeliveryTag, Message, MessageId};
pub use rabbitmq::RabbitMqBackend;
