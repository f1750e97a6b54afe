use std::sync::Arc;

use async_trait::async_trait;
use lapin::options::ConfirmSelectOptions;
use lapin::uri::{AMQPScheme, AMQPUri};
use lapin::Connection;
use tracing::{debug, info};

use crate::common::{Backend, BackendChannel, BackendConnection, BackendError, BrokerAddress};
use crate::config::ConnectionConfig;

use super::channel_manager::RabbitMqChannel;
use super::tokio_exec::connection_properties;

/// AMQP 0-9-1 backend on top of lapin.
#[derive(Debug, Default, Clone, Copy)]
pub struct RabbitMqBackend;

impl RabbitMqBackend {
    pub fn new() -> Self {
        RabbitMqBackend
    }
}

/// Builds the lapin URI, including heartbeat and connect timeout so the
/// broker negotiates them at connection time.
pub fn amqp_uri(address: &BrokerAddress, config: &ConnectionConfig) -> AMQPUri {
    let mut uri = AMQPUri::default();
    uri.scheme = if address.tls() {
        AMQPScheme::AMQPS
    } else {
        AMQPScheme::AMQP
    };
    uri.authority.host = address.host().to_string();
    uri.authority.port = address.port();
    uri.authority.userinfo.username = address.credentials().username.clone();
    uri.authority.userinfo.password = address.credentials().password.clone();
    uri.vhost = address.vhost().to_string();
    uri.query.heartbeat = Some(config.heartbeat_seconds);
    uri.query.connection_timeout = Some(config.connect_timeout_ms);
    uri
}

#[async_trait]
impl Backend for RabbitMqBackend {
    fn name(&self) -> &'static str {
        "rabbitmq"
    }

    async fn open(
        &self,
        address: &BrokerAddress,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn BackendConnection>, BackendError> {
        info!("Connecting to RabbitMQ at {}", address);
        let connection =
            Connection::connect_uri(amqp_uri(address, config), connection_properties(config))
                .await?;
        debug!(heartbeat_seconds = config.heartbeat_seconds, "RabbitMQ connection established");
        Ok(Arc::new(RabbitMqConnection { connection }))
    }
}

pub struct RabbitMqConnection {
    connection: Connection,
}

#[async_trait]
impl BackendConnection for RabbitMqConnection {
    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BackendChannel>, BackendError> {
        let channel = self.connection.create_channel().await?;
        // Every channel runs in confirm mode; unconfirmed publishes just
        // drop the confirm future.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        debug!(channel_id = channel.id(), "Created channel in confirm mode");
        Ok(Arc::new(RabbitMqChannel::new(channel)))
    }

    async fn close(&self) -> Result<(), BackendError> {
        info!("Closing RabbitMQ connection gracefully");
        self.connection.close(200, "Closing connection").await?;
        Ok(())
    }
}
