// Backend-agnostic client core
pub mod ack;
pub mod address;
pub mod backend;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod telemetry;

// Re-export specific items to simplify imports elsewhere
pub use ack::{AckHandle, DeliveryFailure, DeliveryState, FailureCause, Resolution};
pub use address::{AddressError, BrokerAddress, Credentials};
pub use backend::{Backend, BackendChannel, BackendConnection, DeliveryStream, PendingConfirm, QueueSpec};
pub use connection::{Connection, ConnectionManager};
pub use consumer::{Canceller, MessageIterator};
pub use errors::{
    AckError, BackendError, ConnectionError, ConsumeError, MqError, PublishError,
    QueueConflictError, QueueError, Result,
};
pub use publisher::{Ack, PublishOptions};
pub use queue::{QueueHandle, QueueOptions};
pub use retry::{Backoff, RetryBudget, RetryLedger};
pub use telemetry::{Correlation, NoopTelemetry, Operation, Outcome, TelemetryHook, TracingTelemetry};
