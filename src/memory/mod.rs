// In-process broker for tests and demos without a running RabbitMQ

mod backend;
mod broker;

pub use backend::MemoryBackend;
pub use broker::MemoryBroker;
