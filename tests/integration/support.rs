use std::sync::{Arc, Mutex};
use std::time::Duration;

use mqclient_rabbitmq::common::{Correlation, Operation, Outcome, TelemetryHook};
use mqclient_rabbitmq::{BrokerAddress, ClientConfig, Connection, ConnectionManager, MemoryBroker};

pub const ADDRESS: &str = "guest:guest@localhost:5672/%2F";

pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::for_address(ADDRESS);
    config.connection.retry_count = 3;
    config.consumer.processing_deadline_ms = 5_000;
    config
}

pub fn manager(broker: &MemoryBroker, config: ClientConfig) -> ConnectionManager {
    let address = BrokerAddress::parse(&config.address).expect("test address parses");
    ConnectionManager::new(Arc::new(broker.backend()), address, config)
}

pub async fn connect(config: ClientConfig) -> (MemoryBroker, ConnectionManager, Connection) {
    let broker = MemoryBroker::new();
    let manager = manager(&broker, config);
    let connection = manager.connect().await.expect("memory broker accepts connection");
    (broker, manager, connection)
}

/// Counts hook callbacks per phase and operation.
#[derive(Default)]
pub struct CountingTelemetry {
    events: Mutex<Vec<(&'static str, Operation, Option<Outcome>)>>,
}

impl CountingTelemetry {
    pub fn count(&self, phase: &str, op: Operation) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, o, _)| *p == phase && *o == op)
            .count()
    }

    pub fn failures(&self, op: Operation) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, o, outcome)| *o == op && *outcome == Some(Outcome::Failure))
            .count()
    }
}

impl TelemetryHook for CountingTelemetry {
    fn before(&self, op: Operation, _correlation: &Correlation) {
        self.events.lock().unwrap().push(("before", op, None));
    }

    fn after(&self, op: Operation, _correlation: &Correlation, _elapsed: Duration, outcome: Outcome) {
        self.events.lock().unwrap().push(("after", op, Some(outcome)));
    }
}
