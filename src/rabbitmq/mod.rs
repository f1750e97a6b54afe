// RabbitMQ implementation of the backend traits

pub mod connection;       // Backend + connection over lapin
pub mod errors;           // lapin error classification

// Private implementation details
mod channel_manager;
mod tokio_exec;

// Re-export specific items to simplify imports elsewhere
pub use channel_manager::RabbitMqChannel;
pub use connection::{amqp_uri, RabbitMqBackend, RabbitMqConnection};
