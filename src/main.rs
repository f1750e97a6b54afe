use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mqclient_rabbitmq::common::telemetry::{self, SharedTelemetry};
use mqclient_rabbitmq::config::{load_config_or_default, ClientConfig};
use mqclient_rabbitmq::env::{apply_env_overrides, TelemetrySettings};
use mqclient_rabbitmq::{
    BrokerAddress, ConnectionManager, ConsumerConfig, QueueHandle, RabbitMqBackend,
    TracingTelemetry,
};

const DEFAULT_ADDRESS: &str = "localhost:5672";
const DEMO_QUEUE: &str = "mqclient_demo";
const DEMO_BATCH: usize = 10;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Role {
    /// Publish a batch of messages
    Server,
    /// Consume and ack messages until interrupted
    Worker,
}

impl Role {
    fn name(self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Worker => "worker",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "mqclient-rabbitmq")]
#[command(about = "Publish to or consume from a RabbitMQ queue")]
struct Cli {
    #[arg(value_enum)]
    role: Role,

    /// Broker address: [user:password@]host:port[/vhost]. Overrides the
    /// config file; defaults to localhost:5672 when neither sets one.
    #[arg(long)]
    address: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DemoMessage {
    sequence: usize,
    content: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = load_config_or_default(cli.address.as_deref().unwrap_or(DEFAULT_ADDRESS))?;
    apply_env_overrides(&mut config)?;
    apply_cli_address(&mut config, cli.address.as_deref());

    let address = BrokerAddress::parse(&config.address)?;
    let telemetry_settings = TelemetrySettings::load()?;
    let telemetry: SharedTelemetry = if telemetry_settings.enabled() {
        Arc::new(TracingTelemetry::new(telemetry_settings.service_name(cli.role.name())))
    } else {
        telemetry::noop()
    };

    let manager = ConnectionManager::new(Arc::new(RabbitMqBackend::new()), address, config)
        .with_telemetry(telemetry);
    let connection = manager.connect().await?;
    let queue = connection
        .declare(DEMO_QUEUE, true)
        .await
        .context("Failed to declare demo queue")?;

    let result = match cli.role {
        Role::Server => run_server(&queue).await,
        Role::Worker => run_worker(&queue, &manager.config().consumer).await,
    };

    info!("Closing connection...");
    queue.close().await?;
    manager.close().await?;
    result
}

/// `--address` wins over the config file and the environment, but only when given.
fn apply_cli_address(config: &mut ClientConfig, address: Option<&str>) {
    if let Some(address) = address {
        config.address = address.to_string();
    }
}

async fn run_server(queue: &QueueHandle) -> Result<()> {
    for sequence in 0..DEMO_BATCH {
        let message = DemoMessage {
            sequence,
            content: format!("Message {} from server", sequence),
        };
        let ack = queue.publish_json(&message).await?;
        info!(message_id = %ack.message_id, confirmed = ack.confirmed, "Published message {}", sequence);
    }
    info!("Published {} messages to '{}'", DEMO_BATCH, queue.name());
    Ok(())
}

async fn run_worker(queue: &QueueHandle, consumer: &ConsumerConfig) -> Result<()> {
    let mut messages = queue.consume_with(consumer).await?;
    let canceller = messages.canceller();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping worker");
            canceller.cancel();
        }
    });
    if let Some(mut failures) = messages.failures() {
        tokio::spawn(async move {
            while let Some(failure) = failures.recv().await {
                warn!(message_id = %failure.message_id, attempts = failure.attempts, "Message dead-lettered: {:?}", failure.cause);
            }
        });
    }

    info!("Worker consuming from '{}'. Press Ctrl+C to exit.", queue.name());
    while let Some(item) = messages.next().await {
        let (message, handle) = item?;
        match message.json::<DemoMessage>() {
            Ok(demo) => {
                info!(sequence = demo.sequence, redelivered = message.redelivered(), "Received: {}", demo.content);
                handle.ack().await?;
            }
            Err(e) => {
                error!(message_id = %message.id(), "Rejecting malformed message: {}", e);
                handle.reject().await?;
            }
        }
    }

    messages.close().await?;
    Ok(())
}
