use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};
use dotenv::dotenv;

use crate::config::ClientConfig;

pub const ADDRESS_VAR: &str = "MQCLIENT_ADDRESS";
pub const PREFETCH_VAR: &str = "MQCLIENT_PREFETCH";
pub const CONNECT_TIMEOUT_VAR: &str = "MQCLIENT_CONNECT_TIMEOUT_SECONDS";
pub const HEARTBEAT_VAR: &str = "MQCLIENT_HEARTBEAT_SECONDS";
pub const RETRY_COUNT_VAR: &str = "MQCLIENT_RETRY_COUNT";
pub const PROCESSING_DEADLINE_VAR: &str = "MQCLIENT_PROCESSING_DEADLINE_SECONDS";
pub const MAX_RETRIES_VAR: &str = "MQCLIENT_MAX_RETRIES";
pub const PUBLISH_TIMEOUT_VAR: &str = "MQCLIENT_PUBLISH_TIMEOUT_SECONDS";

pub const TELEMETRY_PREFIX_VAR: &str = "MQCLIENT_TELEMETRY_SERVICE_PREFIX";
pub const TELEMETRY_ENDPOINT_VAR: &str = "MQCLIENT_TELEMETRY_ENDPOINT";
pub const TELEMETRY_STDOUT_VAR: &str = "MQCLIENT_TELEMETRY_STDOUT";

fn parsed<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(val) => Ok(Some(
            val.trim().parse().with_context(|| format!("Invalid value for {}", name))?,
        )),
        Err(_) => Ok(None),
    }
}

/// Applies `MQCLIENT_*` variables (a `.env` file is honoured) on top of `config`.
pub fn apply_env_overrides(config: &mut ClientConfig) -> Result<()> {
    dotenv().ok();

    if let Ok(address) = env::var(ADDRESS_VAR) {
        config.address = address;
    }
    if let Some(prefetch) = parsed::<u16>(PREFETCH_VAR)? {
        config.consumer.prefetch = prefetch;
    }
    if let Some(seconds) = parsed::<u64>(CONNECT_TIMEOUT_VAR)? {
        config.connection.connect_timeout_ms = seconds * 1000;
    }
    if let Some(seconds) = parsed::<u16>(HEARTBEAT_VAR)? {
        config.connection.heartbeat_seconds = seconds;
    }
    if let Some(count) = parsed::<u32>(RETRY_COUNT_VAR)? {
        config.connection.retry_count = count;
    }
    if let Some(seconds) = parsed::<u64>(PROCESSING_DEADLINE_VAR)? {
        config.consumer.processing_deadline_ms = seconds * 1000;
    }
    if let Some(retries) = parsed::<u32>(MAX_RETRIES_VAR)? {
        config.retry.max_retries = retries;
    }
    if let Some(seconds) = parsed::<u64>(PUBLISH_TIMEOUT_VAR)? {
        config.publisher.publish_timeout_ms = seconds * 1000;
    }

    config.validate()
}

/// Telemetry settings, read once at process start by the application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySettings {
    pub service_name_prefix: Option<String>,
    pub exporter_endpoint: Option<String>,
    pub stdout: bool,
}

impl TelemetrySettings {
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Ok(TelemetrySettings {
            service_name_prefix: env::var(TELEMETRY_PREFIX_VAR).ok(),
            exporter_endpoint: env::var(TELEMETRY_ENDPOINT_VAR).ok(),
            stdout: parsed::<bool>(TELEMETRY_STDOUT_VAR)?.unwrap_or(false),
        })
    }

    pub fn enabled(&self) -> bool {
        self.stdout || self.exporter_endpoint.is_some()
    }

    pub fn service_name(&self, role: &str) -> String {
        match &self.service_name_prefix {
            Some(prefix) => format!("{}-{}", prefix, role),
            None => role.to_string(),
        }
    }
}
