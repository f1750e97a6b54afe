use std::time::Duration;

use mqclient_rabbitmq::{ConsumerConfig, Resolution};

use crate::support::{connect, test_config};

#[tokio::test(start_paused = true)]
async fn test_get_on_empty_queue_returns_none_after_timeout() {
    let (broker, _manager, connection) = connect(test_config()).await;
    let queue = connection.declare("empty", false).await.unwrap();
    let baseline = broker.open_channels();

    let started = tokio::time::Instant::now();
    assert!(queue.get(Duration::from_secs(2)).await.unwrap().is_none());
    assert!(started.elapsed() >= Duration::from_secs(2));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(broker.open_channels(), baseline);
}

#[tokio::test(start_paused = true)]
async fn test_get_takes_one_message_at_a_time() {
    let (broker, _manager, connection) = connect(test_config()).await;
    let queue = connection.declare("pull", false).await.unwrap();
    let baseline = broker.open_channels();
    queue.publish("one").await.unwrap();
    queue.publish("two").await.unwrap();

    let (message, handle) = queue.get(Duration::from_secs(1)).await.unwrap().unwrap();
    assert_eq!(message.payload(), b"one");
    assert_eq!(broker.ready_count("pull"), 1);
    assert!(matches!(handle.nack().await.unwrap(), Resolution::Requeued { attempt: 1, .. }));

    let (message, handle) = queue.get(Duration::from_secs(1)).await.unwrap().unwrap();
    assert_eq!(message.payload(), b"one");
    assert!(message.redelivered());
    handle.ack().await.unwrap();

    let (message, handle) = queue.get(Duration::from_secs(1)).await.unwrap().unwrap();
    assert_eq!(message.payload(), b"two");
    handle.ack().await.unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(broker.ready_count("pull"), 0);
    assert_eq!(broker.unacked_count("pull"), 0);
    assert_eq!(broker.open_channels(), baseline);
}

#[tokio::test(start_paused = true)]
async fn test_get_waits_for_a_late_publish() {
    let (_broker, _manager, connection) = connect(test_config()).await;
    let queue = connection.declare("late", false).await.unwrap();
    let publisher = connection.declare("late", false).await.unwrap();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        publisher.publish("finally").await.unwrap();
    });

    let (message, handle) = queue.get(Duration::from_secs(5)).await.unwrap().unwrap();
    assert_eq!(message.payload(), b"finally");
    handle.ack().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_inactivity_timeout_ends_the_iterator() {
    let (_broker, _manager, connection) = connect(test_config()).await;
    let queue = connection.declare("quiet", false).await.unwrap();
    queue.publish("only").await.unwrap();

    let config = ConsumerConfig {
        prefetch: 1,
        inactivity_timeout_ms: Some(2_000),
        ..test_config().consumer
    };
    let mut messages = queue.consume_with(&config).await.unwrap();
    let (_message, handle) = messages.next().await.unwrap().unwrap();
    handle.ack().await.unwrap();

    let started = tokio::time::Instant::now();
    assert!(messages.next().await.is_none());
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(messages.next().await.is_none());
    messages.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_inactivity_resets_on_each_delivery() {
    let (_broker, _manager, connection) = connect(test_config()).await;
    let queue = connection.declare("trickle", false).await.unwrap();
    let publisher = connection.declare("trickle", false).await.unwrap();

    tokio::spawn(async move {
        for n in 0..3 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            publisher.publish(format!("m{n}")).await.unwrap();
        }
    });

    let config = ConsumerConfig {
        prefetch: 1,
        inactivity_timeout_ms: Some(1_500),
        ..test_config().consumer
    };
    let mut messages = queue.consume_with(&config).await.unwrap();
    let mut received = 0;
    while let Some(item) = messages.next().await {
        let (_message, handle) = item.unwrap();
        handle.ack().await.unwrap();
        received += 1;
    }
    assert_eq!(received, 3);
}
