use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};

use mqclient_rabbitmq::common::Operation;
use mqclient_rabbitmq::{AckError, DeliveryState, PublishOptions, QueueConflictError, QueueError};

use crate::support::{connect, manager, test_config, CountingTelemetry};

#[tokio::test(start_paused = true)]
async fn test_hello_round_trip() {
    let (_broker, _manager, connection) = connect(test_config()).await;
    let queue = connection.declare("q1", false).await.unwrap();

    let ack = queue.publish("hello").await.unwrap();
    assert!(ack.confirmed);

    let mut messages = queue.consume(1).await.unwrap();
    let (message, handle) = messages.next().await.unwrap().unwrap();
    assert_eq!(message.payload(), b"hello");
    assert!(!message.redelivered());
    assert_eq!(message.id(), &ack.message_id);
    assert!(message.timestamp().is_some());
    handle.ack().await.unwrap();

    let nothing = tokio::time::timeout(Duration::from_secs(1), messages.next()).await;
    assert!(nothing.is_err(), "exactly one message expected");
}

#[tokio::test(start_paused = true)]
async fn test_confirmed_publishes_are_all_delivered() {
    let (broker, _manager, connection) = connect(test_config()).await;
    let queue = connection.declare("orders", true).await.unwrap();

    let mut published = HashSet::new();
    for n in 0..20 {
        let ack = queue.publish(format!("order-{n}")).await.unwrap();
        published.insert(ack.message_id);
    }

    let mut messages = queue.consume(4).await.unwrap();
    let mut received = HashSet::new();
    while received.len() < published.len() {
        let (message, handle) = messages.next().await.unwrap().unwrap();
        assert!(received.insert(message.id().clone()), "duplicate delivery");
        handle.ack().await.unwrap();
    }
    assert_eq!(received, published);
    assert_eq!(broker.ready_count("orders"), 0);
    assert_eq!(broker.unacked_count("orders"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_double_ack_is_rejected() {
    let (_broker, _manager, connection) = connect(test_config()).await;
    let queue = connection.declare("q1", false).await.unwrap();
    queue.publish("once").await.unwrap();

    let mut messages = queue.consume(1).await.unwrap();
    let (_message, handle) = messages.next().await.unwrap().unwrap();
    handle.ack().await.unwrap();
    assert_eq!(handle.state(), DeliveryState::Acked);

    let err = handle.ack().await.unwrap_err();
    assert!(matches!(
        err,
        AckError::AlreadyResolved {
            state: DeliveryState::Acked,
            ..
        }
    ));

    // a clone shares the resolution
    let err = handle.clone().nack().await.unwrap_err();
    assert!(matches!(err, AckError::AlreadyResolved { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_prefetch_bounds_outstanding_messages() {
    let (broker, _manager, connection) = connect(test_config()).await;
    let queue = connection.declare("work", false).await.unwrap();
    for n in 0..5 {
        queue.publish(format!("job-{n}")).await.unwrap();
    }

    let mut messages = queue.consume(2).await.unwrap();
    let (first, first_handle) = messages.next().await.unwrap().unwrap();
    let (_second, second_handle) = messages.next().await.unwrap().unwrap();
    assert_eq!(messages.outstanding(), 2);
    assert!(broker.unacked_count("work") <= 2);

    let blocked = tokio::time::timeout(Duration::from_millis(200), messages.next()).await;
    assert!(blocked.is_err(), "third message handed out past prefetch");

    first_handle.ack().await.unwrap();
    let (third, third_handle) = messages.next().await.unwrap().unwrap();
    assert_ne!(third.id(), first.id());
    assert_eq!(messages.outstanding(), 2);
    assert!(broker.unacked_count("work") <= 2);

    second_handle.ack().await.unwrap();
    third_handle.ack().await.unwrap();
    assert_eq!(messages.outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_zero_prefetch_is_clamped_to_one() {
    let (_broker, _manager, connection) = connect(test_config()).await;
    let queue = connection.declare("work", false).await.unwrap();
    let messages = queue.consume(0).await.unwrap();
    assert_eq!(messages.prefetch(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_competing_consumers_split_the_queue() {
    let (_broker, _manager, connection) = connect(test_config()).await;
    let queue = connection.declare("shared", false).await.unwrap();
    let mut left = queue.consume(1).await.unwrap();
    let mut right = queue.consume(1).await.unwrap();

    queue.publish("a").await.unwrap();
    queue.publish("b").await.unwrap();

    let (a, a_handle) = left.next().await.unwrap().unwrap();
    let (b, b_handle) = right.next().await.unwrap().unwrap();
    assert_ne!(a.payload(), b.payload());
    a_handle.ack().await.unwrap();
    b_handle.ack().await.unwrap();
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u32,
    item: String,
}

#[tokio::test(start_paused = true)]
async fn test_json_messages() {
    let (_broker, _manager, connection) = connect(test_config()).await;
    let queue = connection.declare("orders", false).await.unwrap();
    let order = Order {
        id: 7,
        item: "widget".into(),
    };
    queue.publish_json(&order).await.unwrap();

    let mut messages = queue.consume(1).await.unwrap();
    let (message, handle) = messages.next().await.unwrap().unwrap();
    assert_eq!(message.content_type(), Some("application/json"));
    assert_eq!(message.json::<Order>().unwrap(), order);
    handle.ack().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_supplied_message_id_is_kept() {
    let (_broker, _manager, connection) = connect(test_config()).await;
    let queue = connection.declare("q1", false).await.unwrap();
    let ack = queue
        .publish_with("payload", PublishOptions::default().with_message_id("order-42"))
        .await
        .unwrap();
    assert_eq!(ack.message_id.as_str(), "order-42");

    let mut messages = queue.consume(1).await.unwrap();
    let (message, handle) = messages.next().await.unwrap().unwrap();
    assert_eq!(message.id().as_str(), "order-42");
    assert_eq!(handle.message_id().as_str(), "order-42");
    handle.ack().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stream_adapter() {
    let (_broker, _manager, connection) = connect(test_config()).await;
    let queue = connection.declare("q1", false).await.unwrap();
    for payload in ["x", "y", "z"] {
        queue.publish(payload).await.unwrap();
    }

    let payloads: Vec<Vec<u8>> = queue
        .consume(3)
        .await
        .unwrap()
        .into_stream()
        .take(3)
        .then(|item| async move {
            let (message, handle) = item.unwrap();
            handle.ack().await.unwrap();
            message.into_payload()
        })
        .collect()
        .await;
    assert_eq!(payloads, vec![b"x".to_vec(), b"y".to_vec(), b"z".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn test_redeclare_is_idempotent_but_durability_conflicts() {
    let (_broker, _manager, connection) = connect(test_config()).await;
    connection.declare("jobs", true).await.unwrap();
    connection.declare("jobs", true).await.unwrap();

    let err = connection.declare("jobs", false).await.err().unwrap();
    match err {
        QueueError::Conflict(QueueConflictError {
            queue,
            requested_durable,
            ..
        }) => {
            assert_eq!(queue, "jobs");
            assert!(!requested_durable);
        }
        other => panic!("expected conflict, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_telemetry_hook_sees_publish_receive_and_ack() {
    let broker = mqclient_rabbitmq::MemoryBroker::new();
    let telemetry = Arc::new(CountingTelemetry::default());
    let manager = manager(&broker, test_config()).with_telemetry(telemetry.clone());
    let connection = manager.connect().await.unwrap();
    let queue = connection.declare("traced", false).await.unwrap();

    queue.publish("observed").await.unwrap();
    let mut messages = queue.consume(1).await.unwrap();
    let (_message, handle) = messages.next().await.unwrap().unwrap();
    handle.ack().await.unwrap();

    for op in [Operation::Publish, Operation::Receive, Operation::Ack] {
        assert_eq!(telemetry.count("before", op), 1, "before {op}");
        assert_eq!(telemetry.count("after", op), 1, "after {op}");
    }
    assert_eq!(telemetry.failures(Operation::Publish), 0);
}
