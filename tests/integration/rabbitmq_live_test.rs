use std::sync::Arc;

use uuid::Uuid;

use mqclient_rabbitmq::{BrokerAddress, ClientConfig, ConnectionManager, RabbitMqBackend};

fn live_address() -> String {
    std::env::var("MQCLIENT_ADDRESS").unwrap_or_else(|_| "guest:guest@localhost:5672/%2F".into())
}

#[tokio::test]
#[ignore] // Ignore by default as it requires a running RabbitMQ instance
async fn test_hello_against_rabbitmq() {
    let config = ClientConfig::for_address(live_address());
    let address = BrokerAddress::parse(&config.address).unwrap();
    let manager = ConnectionManager::new(Arc::new(RabbitMqBackend::new()), address, config);

    let connection = manager.connect().await.unwrap();
    let queue_name = format!("mqclient-test-{}", Uuid::new_v4());
    let queue = connection.declare(&queue_name, false).await.unwrap();

    let ack = queue.publish("hello").await.unwrap();
    assert!(ack.confirmed);

    let mut messages = queue.consume(1).await.unwrap();
    let (message, handle) = messages.next().await.unwrap().unwrap();
    assert_eq!(message.payload(), b"hello");
    assert!(!message.redelivered());
    handle.ack().await.unwrap();

    messages.close().await.unwrap();
    queue.close().await.unwrap();
    manager.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Ignore by default as it requires a running RabbitMQ instance
async fn test_durability_conflict_against_rabbitmq() {
    let config = ClientConfig::for_address(live_address());
    let address = BrokerAddress::parse(&config.address).unwrap();
    let manager = ConnectionManager::new(Arc::new(RabbitMqBackend::new()), address, config);

    let connection = manager.connect().await.unwrap();
    let queue_name = format!("mqclient-test-{}", Uuid::new_v4());
    connection.declare(&queue_name, true).await.unwrap();

    let err = connection.declare(&queue_name, false).await.err().unwrap();
    assert!(matches!(err, mqclient_rabbitmq::QueueError::Conflict(_)));
    manager.close().await.unwrap();
}
