// Integration tests for the client, run against the in-memory broker.
// Tests that need a running RabbitMQ are #[ignore]d.

mod support;

mod connection_test;
mod delivery_test;
mod lifecycle_test;
mod publish_test;
mod pull_test;
mod rabbitmq_live_test;
