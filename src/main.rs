use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use rabbit_strategy::config::{self, RabbitConfig};
use rabbit_strategy::env::EnvOverrides;
use rabbit_strategy::{
    Aes256GcmEncryption, BatchProducer, ConnectionManager, ConsoleProduce, Consumer,
    ConsumerCommand, ExitStatus, MessageHandler, Producer, ProducerCommand, QueueStrategy,
    QueueTemplate, ReceivedMessage, RunOptions, TracingEventSink,
};

/// Produce to and consume from a RabbitMQ queue with a basic or fault tolerant strategy
#[derive(Parser)]
#[command(name = "rabbit_strategy")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Verbose output, also turns on AMQP wire logging
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Queue strategy: basic or fault_tolerant
    #[arg(short, long, global = true)]
    strategy: Option<QueueStrategy>,

    /// Queue name
    #[arg(short, long, global = true)]
    queue: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Produce messages from the console
    Produce {
        /// The message
        message: String,

        /// How many times the message must be published
        #[arg(short, long, default_value_t = 1)]
        repeat: usize,

        /// The message is base64 encoded
        #[arg(short, long)]
        base64: bool,

        /// Stage all messages and commit them at once
        #[arg(long)]
        batch: bool,
    },

    /// Consume messages until interrupted or the subscription ends
    Consume {
        /// Seconds to sleep after each delivery
        #[arg(long)]
        interval: Option<u64>,

        /// Consumer tag, generated when empty
        #[arg(long)]
        consumer_tag: Option<String>,

        /// Give up a single wait after this many seconds and check for shutdown
        #[arg(long)]
        wait_timeout: Option<u64>,
    },

    /// Write a default configuration file
    InitConfig {
        path: PathBuf,
    },
}

/// Logs every message and accepts it.
struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, message: &ReceivedMessage) -> anyhow::Result<bool> {
        info!(
            delivery_tag = message.delivery_tag,
            redelivered = message.redelivered,
            "Received: {}",
            serde_json::Value::Object(message.body.clone())
        );
        Ok(true)
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug,lapin=debug" } else { "info,lapin=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn resolve_config(cli: &Cli) -> Result<RabbitConfig> {
    let mut config = match &cli.config {
        Some(path) => config::load_config_from(path)?,
        None => match config::find_config_file() {
            Ok(path) => config::load_config_from(&path)?,
            Err(e) => {
                debug!("{}, using defaults", e);
                RabbitConfig::default()
            }
        },
    };

    let overrides = EnvOverrides::load().context("Invalid environment configuration")?;
    config.apply_env(&overrides);

    if let Some(strategy) = cli.strategy {
        config.queue.strategy = strategy;
    }
    if let Some(queue) = &cli.queue {
        config.queue.name = queue.clone();
    }

    config.validate()?;
    Ok(config)
}

fn build_template(config: &RabbitConfig) -> Result<Arc<QueueTemplate>> {
    let connection = ConnectionManager::new(&config.connection.amqp_uri())
        .with_reconnect_policy(
            config.connection.reconnect_attempts,
            config.connection.reconnect_delay_ms,
        )
        .with_connect_timeout(config.connect_timeout());

    let mut template = QueueTemplate::new(
        Arc::new(connection),
        config.queue.strategy,
        &config.queue.name,
    )
    .with_exchange(&config.queue.exchange)
    .with_passive(config.queue.passive)
    .with_exclusive(config.queue.exclusive)
    .with_event_sink(Arc::new(TracingEventSink));

    if let Some(routing_key) = &config.queue.routing_key {
        template = template.with_routing_key(routing_key);
    }
    if let Some(secret_key) = &config.queue.secret_key {
        template = template.with_encryption(Box::new(Aes256GcmEncryption::new(secret_key)?));
    }

    Ok(Arc::new(template))
}

async fn consume(
    config: &RabbitConfig,
    template: Arc<QueueTemplate>,
    debug: bool,
) -> ExitStatus {
    let consumer = Consumer::new(template, LoggingHandler, &config.consumer.consumer_tag)
        .with_no_local(config.consumer.no_local)
        .with_no_wait(config.consumer.no_wait);

    let options = RunOptions {
        interval: config.interval(),
        wait_timeout: config.wait_timeout(),
        debug,
    };
    let mut command = ConsumerCommand::new(consumer, options);

    let stop = command.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current cycle");
            stop.stop();
        }
    });

    command.execute().await
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose > 0);

    let status = match &cli.command {
        Command::InitConfig { path } => {
            config::create_default_config_file(path)?;
            println!("Configuration file created at: {}", path.display());
            ExitStatus::Success
        }
        Command::Produce {
            message,
            repeat,
            base64,
            batch,
        } => {
            let config = resolve_config(&cli)?;
            let template = build_template(&config)?;
            let step = ConsoleProduce {
                message: message.clone(),
                repeat: *repeat,
                base64: *base64,
            };

            let mut stdout = std::io::stdout();
            if *batch {
                ProducerCommand::new(BatchProducer::new(template))
                    .execute(&step, &mut stdout)
                    .await
            } else {
                ProducerCommand::new(Producer::new(template))
                    .execute(&step, &mut stdout)
                    .await
            }
        }
        Command::Consume {
            interval,
            consumer_tag,
            wait_timeout,
        } => {
            let mut config = resolve_config(&cli)?;
            if let Some(seconds) = interval {
                config.consumer.interval_seconds = *seconds;
            }
            if let Some(tag) = consumer_tag {
                config.consumer.consumer_tag = tag.clone();
            }
            if let Some(seconds) = wait_timeout {
                config.consumer.wait_timeout_seconds = Some(*seconds);
            }

            info!(
                queue = %config.queue.name,
                strategy = %config.queue.strategy,
                "Starting consumer"
            );
            let template = build_template(&config)?;
            consume(&config, template, cli.verbose > 0).await
        }
    };

    if status == ExitStatus::Failure {
        debug!(code = status.code(), "Exiting with failure");
    }
    Ok(status.into())
}
