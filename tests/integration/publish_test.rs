use std::time::Duration;

use mqclient_rabbitmq::{PublishError, PublishOptions};

use crate::support::{connect, test_config};

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_publish_times_out() {
    let mut config = test_config();
    config.publisher.publish_timeout_ms = 1_000;
    let (broker, _manager, connection) = connect(config).await;
    let queue = connection.declare("slow-confirms", false).await.unwrap();
    broker.set_confirm_delay(Duration::from_secs(30));

    let err = queue.publish("late").await.unwrap_err();
    assert!(matches!(err, PublishError::Timeout(timeout) if timeout == Duration::from_secs(1)));
}

#[tokio::test(start_paused = true)]
async fn test_fire_and_forget_skips_the_confirm() {
    let (broker, _manager, connection) = connect(test_config()).await;
    let queue = connection.declare("fast", false).await.unwrap();
    broker.set_confirm_delay(Duration::from_secs(30));

    let started = tokio::time::Instant::now();
    let ack = queue
        .publish_with("quick", PublishOptions::default().with_confirm(false))
        .await
        .unwrap();
    assert!(!ack.confirmed);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(broker.ready_count("fast"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_publish_after_connection_loss() {
    let (broker, manager, connection) = connect(test_config()).await;
    let queue = connection.declare("q1", false).await.unwrap();
    broker.drop_connections();

    let err = queue.publish("lost").await.unwrap_err();
    assert!(matches!(err, PublishError::ChannelClosed(_)));

    // a fresh handle on a new connection works again
    let connection = manager.connect().await.unwrap();
    let queue = connection.declare("q1", false).await.unwrap();
    assert!(queue.publish("found").await.unwrap().confirmed);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_publish() {
    let (_broker, _manager, connection) = connect(test_config()).await;
    let queue = connection.declare("durable-q", true).await.unwrap();
    let ack = queue
        .publish_with("keep me", PublishOptions::default().with_persistent(true))
        .await
        .unwrap();
    assert!(ack.confirmed);

    let mut messages = queue.consume(1).await.unwrap();
    let (message, handle) = messages.next().await.unwrap().unwrap();
    assert_eq!(message.payload(), b"keep me");
    handle.ack().await.unwrap();
}
