use std::time::Duration;

use mqclient_rabbitmq::common::Credentials;
use mqclient_rabbitmq::{ConnectionError, MemoryBroker};

use crate::support::{connect, manager, test_config};

#[tokio::test(start_paused = true)]
async fn test_unreachable_broker_exhausts_with_increasing_backoff() {
    let broker = MemoryBroker::new();
    broker.set_unreachable(true);
    let manager = manager(&broker, test_config());

    let err = manager.connect().await.err().expect("connect should fail");
    assert!(
        matches!(err, ConnectionError::Exhausted { attempts: 3, .. }),
        "unexpected error: {err:?}"
    );

    let attempts = broker.connect_attempts();
    assert_eq!(attempts.len(), 3);
    let first_gap = attempts[1] - attempts[0];
    let second_gap = attempts[2] - attempts[1];
    // 1s then 2s, each within ±15% jitter
    assert!(first_gap >= Duration::from_millis(850) && first_gap <= Duration::from_millis(1150));
    assert!(second_gap >= Duration::from_millis(1700) && second_gap <= Duration::from_millis(2300));
    assert!(second_gap > first_gap);
}

#[tokio::test(start_paused = true)]
async fn test_connect_succeeds_once_broker_comes_back() {
    let broker = MemoryBroker::new();
    broker.set_unreachable(true);
    let mut config = test_config();
    config.connection.retry_count = 5;
    let manager = manager(&broker, config);

    let restarter = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        restarter.set_unreachable(false);
    });

    let connection = manager.connect().await.unwrap();
    assert!(connection.is_connected());
    assert!(broker.connect_attempts().len() >= 3);
}

#[tokio::test]
async fn test_bad_credentials_fail_without_retry() {
    let broker = MemoryBroker::new();
    broker.require_credentials(Credentials {
        username: "guest".into(),
        password: "guest".into(),
    });
    let mut config = test_config();
    config.address = "guest:wrong@localhost:5672".into();
    let manager = manager(&broker, config);

    let err = manager.connect().await.err().expect("connect should fail");
    assert!(matches!(err, ConnectionError::Rejected(_)));
    assert_eq!(broker.connect_attempts().len(), 1);
}

#[tokio::test]
async fn test_connect_reuses_live_connection() {
    let (broker, manager, _connection) = connect(test_config()).await;
    manager.connect().await.unwrap();
    assert_eq!(broker.connect_attempts().len(), 1);
}

#[tokio::test]
async fn test_reconnects_after_connection_loss() {
    let (broker, manager, connection) = connect(test_config()).await;

    broker.drop_connections();
    assert!(!connection.is_connected());

    let fresh = manager.connect().await.unwrap();
    assert!(fresh.is_connected());
    assert_eq!(broker.connect_attempts().len(), 2);
}

#[tokio::test]
async fn test_close_without_connection() {
    let broker = MemoryBroker::new();
    let manager = manager(&broker, test_config());

    let err = manager.close().await.unwrap_err();
    assert!(matches!(err, ConnectionError::NotConnected));
}

#[tokio::test]
async fn test_close_twice() {
    let (_broker, manager, connection) = connect(test_config()).await;

    manager.close().await.unwrap();
    assert!(!connection.is_connected());

    let err = manager.close().await.unwrap_err();
    assert!(matches!(err, ConnectionError::NotConnected));
}

#[tokio::test]
async fn test_declare_on_closed_connection() {
    let (_broker, manager, connection) = connect(test_config()).await;
    manager.close().await.unwrap();

    let err = connection.declare("q1", false).await.err().unwrap();
    assert!(matches!(
        err,
        mqclient_rabbitmq::QueueError::Connection(ConnectionError::NotConnected)
    ));
}
