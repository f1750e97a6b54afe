use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const CONFIG_FILE_NAME: &str = "mqclient-rabbitmq.json";

// Configuration structures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// `[user:password@]host:port[/vhost]`
    pub address: String,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub dead_letter: DeadLetterPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_heartbeat")]
    pub heartbeat_seconds: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Total connection attempts before giving up.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub retry_backoff_max_ms: u64,
    #[serde(default)]
    pub connection_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[serde(default = "default_true")]
    pub confirm: bool,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
    /// Unresolved messages are requeued once this elapses.
    #[serde(default = "default_processing_deadline")]
    pub processing_deadline_ms: u64,
    /// `next()` yields `None` after this long without a delivery.
    #[serde(default)]
    pub inactivity_timeout_ms: Option<u64>,
}

/// Per-message retry budget applied by the ack controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first requeue; doubles per attempt.
    #[serde(default)]
    pub backoff_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
    /// Budgets not charged for this long are forgotten.
    #[serde(default = "default_budget_ttl")]
    pub budget_ttl_ms: u64,
}

/// Where messages go once their retry budget is spent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeadLetterPolicy {
    /// Nack without requeue and let the broker discard it.
    #[default]
    Drop,
    /// Queue is declared with `x-dead-letter-exchange`; the broker reroutes.
    BrokerNative {
        exchange: String,
        #[serde(default)]
        routing_key: Option<String>,
    },
    /// The client republishes the payload to another queue, then acks.
    FallbackQueue { queue: String },
}

// Default values
fn default_heartbeat() -> u16 { 30 }
fn default_connect_timeout() -> u64 { 5000 }
fn default_retry_count() -> u32 { 5 }
fn default_retry_backoff() -> u64 { 1000 }
fn default_backoff_max() -> u64 { 30000 }
fn default_true() -> bool { true }
fn default_publish_timeout() -> u64 { 10000 }
fn default_prefetch() -> u16 { 1 }
fn default_processing_deadline() -> u64 { 300_000 }
fn default_max_retries() -> u32 { 3 }
fn default_budget_ttl() -> u64 { 3_600_000 }

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_seconds: default_heartbeat(),
            connect_timeout_ms: default_connect_timeout(),
            retry_count: default_retry_count(),
            retry_backoff_ms: default_retry_backoff(),
            retry_backoff_max_ms: default_backoff_max(),
            connection_name: None,
        }
    }
}

impl ConnectionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.heartbeat_seconds))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_max_ms)
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            confirm: true,
            persistent: false,
            publish_timeout_ms: default_publish_timeout(),
        }
    }
}

impl PublisherConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            prefetch: default_prefetch(),
            processing_deadline_ms: default_processing_deadline(),
            inactivity_timeout_ms: None,
        }
    }
}

impl ConsumerConfig {
    pub fn processing_deadline(&self) -> Duration {
        Duration::from_millis(self.processing_deadline_ms)
    }

    pub fn inactivity_timeout(&self) -> Option<Duration> {
        self.inactivity_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: 0,
            backoff_max_ms: default_backoff_max(),
            budget_ttl_ms: default_budget_ttl(),
        }
    }
}

impl RetryPolicy {
    pub fn budget_ttl(&self) -> Duration {
        Duration::from_millis(self.budget_ttl_ms)
    }
}

impl ClientConfig {
    pub fn for_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connection: ConnectionConfig::default(),
            publisher: PublisherConfig::default(),
            consumer: ConsumerConfig::default(),
            retry: RetryPolicy::default(),
            dead_letter: DeadLetterPolicy::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(anyhow!("Configuration error: address cannot be empty"));
        }
        if self.consumer.prefetch == 0 {
            return Err(anyhow!("Configuration error: consumer.prefetch must be at least 1"));
        }
        if self.connection.retry_count == 0 {
            return Err(anyhow!("Configuration error: connection.retry_count must be at least 1"));
        }
        Ok(())
    }
}

// Configuration loading and management functions
pub fn find_config_file() -> Result<PathBuf> {
    let config_dir_path = Path::new("config").join(CONFIG_FILE_NAME);
    let locations = [
        ("Current directory", Path::new(CONFIG_FILE_NAME).to_path_buf()),
        ("Current directory (alternative)", config_dir_path),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.clone());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find {} configuration file in the current directory, config/, or your home directory",
        CONFIG_FILE_NAME
    ))
}

pub fn load_config_from(path: &Path) -> Result<ClientConfig> {
    let config_content = fs::read_to_string(path)
        .context(format!("Failed to read config file at {}", path.display()))?;

    let config: ClientConfig = serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON or missing required fields")?;

    config.validate()?;
    Ok(config)
}

/// Loads the config file if one exists, otherwise defaults for `fallback_address`.
pub fn load_config_or_default(fallback_address: &str) -> Result<ClientConfig> {
    match find_config_file() {
        Ok(path) => load_config_from(&path),
        Err(e) => {
            debug!("Using default configuration: {}", e);
            Ok(ClientConfig::for_address(fallback_address))
        }
    }
}
