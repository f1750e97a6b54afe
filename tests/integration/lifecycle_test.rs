use std::time::Duration;

use futures::StreamExt;
use mqclient_rabbitmq::{AckError, ConsumeError, DeliveryState};

use crate::support::{connect, test_config};

#[tokio::test(start_paused = true)]
async fn test_canceller_wakes_suspended_next() {
    let (_broker, _manager, connection) = connect(test_config()).await;
    let queue = connection.declare("idle", false).await.unwrap();
    let mut messages = queue.consume(1).await.unwrap();

    let canceller = messages.canceller();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        canceller.cancel();
    });

    assert!(messages.next().await.is_none());
    // stays finished
    assert!(messages.next().await.is_none());
    messages.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_close_waits_for_in_flight_and_requeues_buffered() {
    let (broker, _manager, connection) = connect(test_config()).await;
    let queue = connection.declare("drain", false).await.unwrap();
    for n in 0..3 {
        queue.publish(format!("m{n}")).await.unwrap();
    }

    let mut messages = queue.consume(3).await.unwrap();
    let (first, handle) = messages.next().await.unwrap().unwrap();
    assert_eq!(first.payload(), b"m0");

    let worker = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.ack().await.unwrap();
        handle
    });

    let started = tokio::time::Instant::now();
    messages.close().await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(2));

    let handle = worker.await.unwrap();
    assert_eq!(handle.state(), DeliveryState::Acked);
    assert_eq!(broker.unacked_count("drain"), 0);
    assert_eq!(
        broker.ready_payloads("drain"),
        vec![b"m1".to_vec(), b"m2".to_vec()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_abort_requeues_processing_messages() {
    let (broker, _manager, connection) = connect(test_config()).await;
    let queue = connection.declare("abort", false).await.unwrap();
    queue.publish("half done").await.unwrap();

    let mut messages = queue.consume(1).await.unwrap();
    let (_message, handle) = messages.next().await.unwrap().unwrap();

    messages.abort().await.unwrap();
    assert_eq!(handle.state(), DeliveryState::Requeued);
    assert!(matches!(
        handle.ack().await.unwrap_err(),
        AckError::AlreadyResolved { .. }
    ));
    assert_eq!(broker.ready_count("abort"), 1);

    // the shutdown requeue is not a failure: the budget is untouched
    let mut again = queue.consume(1).await.unwrap();
    let (message, handle) = again.next().await.unwrap().unwrap();
    assert!(message.redelivered());
    assert!(matches!(
        handle.nack().await.unwrap(),
        mqclient_rabbitmq::Resolution::Requeued { attempt: 1, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_iterator_releases_consumer() {
    let (broker, _manager, connection) = connect(test_config()).await;
    let queue = connection.declare("dropped", false).await.unwrap();

    let messages = queue.consume(1).await.unwrap();
    drop(messages);
    tokio::time::sleep(Duration::from_millis(10)).await;

    queue.publish("later").await.unwrap();
    assert_eq!(broker.ready_count("dropped"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_ends_consumer_with_error() {
    let (broker, _manager, connection) = connect(test_config()).await;
    let queue = connection.declare("fragile", false).await.unwrap();
    let mut messages = queue.consume(1).await.unwrap();

    broker.drop_connections();

    let err = messages.next().await.unwrap().unwrap_err();
    assert!(matches!(err, ConsumeError::ChannelClosed(_)));
    assert!(messages.next().await.is_none());
    assert!(!queue.is_open());
}

#[tokio::test(start_paused = true)]
async fn test_ack_after_connection_loss_reports_channel_closed() {
    let (broker, _manager, connection) = connect(test_config()).await;
    let queue = connection.declare("fragile", false).await.unwrap();
    queue.publish("in flight").await.unwrap();
    let mut messages = queue.consume(1).await.unwrap();
    let (_message, handle) = messages.next().await.unwrap().unwrap();

    broker.drop_connections();

    let err = handle.ack().await.unwrap_err();
    assert!(matches!(err, AckError::ChannelClosed { .. }));
    // resolved locally; not resent
    assert_eq!(handle.state(), DeliveryState::Acked);
    assert!(matches!(
        handle.ack().await.unwrap_err(),
        AckError::AlreadyResolved { .. }
    ));
    // the broker put it back on its own
    assert_eq!(broker.ready_count("fragile"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_stream_closes_consumer_channel() {
    let (broker, _manager, connection) = connect(test_config()).await;
    let queue = connection.declare("streamed", false).await.unwrap();
    let baseline = broker.open_channels();
    queue.publish("one").await.unwrap();

    let mut stream = Box::pin(queue.consume(1).await.unwrap().into_stream());
    let (_message, handle) = stream.next().await.unwrap().unwrap();
    handle.ack().await.unwrap();
    assert_eq!(broker.open_channels(), baseline + 1);

    drop(stream);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(broker.open_channels(), baseline);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_iterator_keeps_channel_until_handles_resolve() {
    let (broker, _manager, connection) = connect(test_config()).await;
    let queue = connection.declare("pending", false).await.unwrap();
    let baseline = broker.open_channels();
    queue.publish("a").await.unwrap();
    queue.publish("b").await.unwrap();

    let mut messages = queue.consume(2).await.unwrap();
    let (_message, handle) = messages.next().await.unwrap().unwrap();
    drop(messages);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(broker.open_channels(), baseline + 1);

    handle.ack().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(broker.open_channels(), baseline);
    // the buffered, never yielded one is back
    assert_eq!(broker.ready_payloads("pending"), vec![b"b".to_vec()]);
    assert_eq!(broker.unacked_count("pending"), 0);
}
