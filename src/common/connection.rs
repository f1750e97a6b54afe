use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use crate::config::ClientConfig;

use super::address::BrokerAddress;
use super::backend::{Backend, BackendConnection};
use super::errors::{BackendError, ConnectionError, QueueError};
use super::queue::{QueueHandle, QueueOptions};
use super::retry::{Backoff, RetryLedger};
use super::telemetry::{self, SharedTelemetry};

/// Retry budgets per queue name, shared by every handle declared on one
/// connection.
type Ledgers = Arc<StdMutex<HashMap<String, Arc<RetryLedger>>>>;

/// Handle to the live broker session. Cheap to clone; the session itself is
/// owned by the [`ConnectionManager`].
#[derive(Clone)]
pub struct Connection {
    inner: Arc<dyn BackendConnection>,
    config: Arc<ClientConfig>,
    telemetry: SharedTelemetry,
    ledgers: Ledgers,
}

impl Connection {
    fn new(inner: Arc<dyn BackendConnection>, config: Arc<ClientConfig>, telemetry: SharedTelemetry) -> Self {
        Self {
            inner,
            config,
            telemetry,
            ledgers: Arc::default(),
        }
    }

    fn ledger(&self, queue: &str) -> Arc<RetryLedger> {
        let mut ledgers = self.ledgers.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            ledgers
                .entry(queue.to_string())
                .or_insert_with(|| Arc::new(RetryLedger::new(&self.config.retry))),
        )
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Declares `name` (or asserts it exists with the same durability).
    pub async fn declare(&self, name: &str, durable: bool) -> Result<QueueHandle, QueueError> {
        let options = QueueOptions::new(name, durable).with_dead_letter(self.config.dead_letter.clone());
        self.declare_with(options).await
    }

    pub async fn declare_with(&self, options: QueueOptions) -> Result<QueueHandle, QueueError> {
        if !self.inner.is_connected() {
            return Err(QueueError::Connection(ConnectionError::NotConnected));
        }
        let ledger = self.ledger(&options.name);
        QueueHandle::declare(
            Arc::clone(&self.inner),
            options,
            Arc::clone(&self.config),
            ledger,
            Arc::clone(&self.telemetry),
        )
        .await
    }
}

pub struct ConnectionManager {
    backend: Arc<dyn Backend>,
    address: BrokerAddress,
    config: Arc<ClientConfig>,
    telemetry: SharedTelemetry,
    current: Mutex<Option<Connection>>,
}

impl ConnectionManager {
    pub fn new(backend: Arc<dyn Backend>, address: BrokerAddress, config: ClientConfig) -> Self {
        ConnectionManager {
            backend,
            address,
            config: Arc::new(config),
            telemetry: telemetry::noop(),
            current: Mutex::new(None),
        }
    }

    /// Registers a telemetry hook for every queue declared from now on.
    pub fn with_telemetry(mut self, telemetry: SharedTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn address(&self) -> &BrokerAddress {
        &self.address
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the live connection, (re)establishing it when needed.
    pub async fn connect(&self) -> Result<Connection, ConnectionError> {
        let mut current = self.current.lock().await;
        if let Some(connection) = current.as_ref() {
            if connection.is_connected() {
                return Ok(connection.clone());
            }
            warn!(address = %self.address, "Connection lost, reconnecting");
        }

        let inner = self.establish_connection().await?;
        let connection = Connection::new(inner, Arc::clone(&self.config), Arc::clone(&self.telemetry));
        *current = Some(connection.clone());
        Ok(connection)
    }

    async fn establish_connection(&self) -> Result<Arc<dyn BackendConnection>, ConnectionError> {
        let settings = &self.config.connection;
        let max_attempts = settings.retry_count.max(1);
        let backoff = Backoff::new(settings.retry_backoff(), settings.retry_backoff_max());
        let mut attempt = 0;

        loop {
            attempt += 1;
            info!(
                backend = self.backend.name(),
                "Attempting to connect to {} (attempt {}/{})",
                self.address,
                attempt,
                max_attempts
            );

            let result = match timeout(
                settings.connect_timeout(),
                self.backend.open(&self.address, settings),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(BackendError::Unreachable(format!(
                    "connect timed out after {:?}",
                    settings.connect_timeout()
                ))),
            };

            let err = match result {
                Ok(connection) => {
                    info!(address = %self.address, "Successfully connected");
                    return Ok(connection);
                }
                Err(BackendError::Rejected(reason)) => {
                    error!(address = %self.address, "Broker rejected connection: {}", reason);
                    return Err(ConnectionError::Rejected(reason));
                }
                Err(err) => err,
            };

            error!(
                "Failed to connect (attempt {}/{}): {}",
                attempt, max_attempts, err
            );
            if attempt >= max_attempts {
                error!("Max connection attempts reached. Giving up.");
                return Err(ConnectionError::Exhausted {
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            }

            let delay = backoff.jittered(attempt);
            info!("Waiting {:?} before next connect attempt", delay);
            sleep(delay).await;
        }
    }

    /// Closes the connection; queue handles and consumers on it die with it.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        let connection = self
            .current
            .lock()
            .await
            .take()
            .ok_or(ConnectionError::NotConnected)?;

        if !connection.is_connected() {
            return Err(ConnectionError::NotConnected);
        }

        info!(address = %self.address, "Closing connection gracefully");
        connection.inner.close().await.map_err(|e| {
            warn!("Error while closing connection: {}", e);
            ConnectionError::CloseFailed(e.to_string())
        })
    }
}
