use std::io::Write;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::message::Payload;
use crate::rabbitmq::consumer::{Consumer, MessageHandler, WaitOutcome};
use crate::rabbitmq::publisher::Publisher;
use crate::rabbitmq::template::QueueTemplate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failure => 1,
        }
    }
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        ExitCode::from(status.code())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Pause after every cycle.
    pub interval: Duration,
    /// Upper bound for a single wait. `None` waits until a delivery arrives.
    pub wait_timeout: Option<Duration>,
    /// Logs every cycle at info level.
    pub debug: bool,
}

/// Shared flag that ends the consumer loop before its next cycle.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Extension points around every wait of the consumer loop.
#[async_trait]
pub trait CycleHooks: Send + Sync {
    async fn pre_process(&mut self) {}

    async fn post_process(&mut self) {}
}

/// Sleeps for a fixed interval after each cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pacing {
    interval: Duration,
}

impl Pacing {
    pub fn new(interval: Duration) -> Self {
        Pacing { interval }
    }
}

#[async_trait]
impl CycleHooks for Pacing {
    async fn post_process(&mut self) {
        if !self.interval.is_zero() {
            tokio::time::sleep(self.interval).await;
        }
    }
}

async fn close_template(template: &QueueTemplate) {
    if let Err(e) = template.close().await {
        error!(queue = %template.queue_name(), "Failed to close: {}", e);
    }
}

/// Drives a consumer: connect, declare, listen once, then wait for deliveries
/// until stopped or until the channel has no subscription left.
pub struct ConsumerCommand<H, K = Pacing> {
    consumer: Consumer<H>,
    hooks: K,
    options: RunOptions,
    stop: StopHandle,
}

impl<H: MessageHandler> ConsumerCommand<H, Pacing> {
    pub fn new(consumer: Consumer<H>, options: RunOptions) -> Self {
        ConsumerCommand {
            hooks: Pacing::new(options.interval),
            consumer,
            options,
            stop: StopHandle::default(),
        }
    }
}

impl<H: MessageHandler, K: CycleHooks> ConsumerCommand<H, K> {
    pub fn with_hooks<T: CycleHooks>(self, hooks: T) -> ConsumerCommand<H, T> {
        ConsumerCommand {
            consumer: self.consumer,
            hooks,
            options: self.options,
            stop: self.stop,
        }
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn consumer(&self) -> &Consumer<H> {
        &self.consumer
    }

    pub fn hooks(&self) -> &K {
        &self.hooks
    }

    pub async fn can_continue(&self) -> bool {
        !self.stop.is_stopped() && self.consumer.is_busy().await
    }

    pub async fn execute(&mut self) -> ExitStatus {
        let template = self.consumer.template().clone();

        if !self.consumer.connect().await {
            close_template(&template).await;
            return ExitStatus::Failure;
        }

        if let Err(e) = self.consumer.listen().await {
            error!(queue = %template.queue_name(), "Unable to listen: {}", e);
            close_template(&template).await;
            return ExitStatus::Failure;
        }

        let status = self.run_cycles().await;
        close_template(&template).await;
        status
    }

    async fn run_cycles(&mut self) -> ExitStatus {
        let mut cycle: u64 = 0;

        while self.can_continue().await {
            cycle += 1;
            if self.options.debug {
                info!(cycle, consumer_tag = %self.consumer.consumer_tag(), "Waiting for delivery");
            }

            self.hooks.pre_process().await;

            match self.consumer.wait(self.options.wait_timeout).await {
                Ok(WaitOutcome::Delivered(outcome)) => debug!(cycle, ?outcome, "Cycle finished"),
                Ok(WaitOutcome::TimedOut) => debug!(cycle, "No delivery within the wait timeout"),
                Ok(WaitOutcome::Closed) => info!(cycle, "Subscription closed by the broker"),
                Err(e) => {
                    error!(cycle, "Consumer stopped: {}", e);
                    return ExitStatus::Failure;
                }
            }

            self.hooks.post_process().await;
        }

        if self.stop.is_stopped() {
            info!("Stop requested, shutting down consumer");
        }
        ExitStatus::Success
    }
}

/// One unit of work for a [`ProducerCommand`].
#[async_trait]
pub trait Produce: Send + Sync {
    /// Returns how many messages were published.
    async fn produce(&self, publisher: &dyn Publisher) -> anyhow::Result<usize>;
}

/// Publishes `{"message": <text>}` a number of times.
#[derive(Debug, Clone)]
pub struct ConsoleProduce {
    pub message: String,
    pub repeat: usize,
    pub base64: bool,
}

impl ConsoleProduce {
    pub fn new(message: &str) -> Self {
        ConsoleProduce {
            message: message.to_string(),
            repeat: 1,
            base64: false,
        }
    }

    /// The message text, base64-decoded when requested. Falls back to the raw text.
    pub fn text(&self) -> String {
        if !self.base64 {
            return self.message.clone();
        }

        match STANDARD.decode(self.message.trim()) {
            Ok(bytes) if !bytes.is_empty() => String::from_utf8(bytes).unwrap_or_else(|_| {
                warn!("Decoded message is not valid UTF-8, publishing it as is");
                self.message.clone()
            }),
            _ => {
                warn!("Message is not valid base64, publishing it as is");
                self.message.clone()
            }
        }
    }
}

#[async_trait]
impl Produce for ConsoleProduce {
    async fn produce(&self, publisher: &dyn Publisher) -> anyhow::Result<usize> {
        if self.message.is_empty() {
            warn!("Empty message, nothing to publish");
            return Ok(0);
        }

        let text = self.text();
        let repeat = self.repeat.max(1);
        for _ in 0..repeat {
            let mut data = Payload::new();
            data.insert("message".to_string(), Value::String(text.clone()));
            publisher.publish(data).await?;
        }
        Ok(repeat)
    }
}

/// Connects a publisher, runs one produce step, flushes and closes.
pub struct ProducerCommand<P> {
    publisher: P,
}

impl<P: Publisher> ProducerCommand<P> {
    pub fn new(publisher: P) -> Self {
        ProducerCommand { publisher }
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Errors are written to `output` as `Error occurred: ...` and reported as a failure.
    pub async fn execute<S, W>(&self, step: &S, output: &mut W) -> ExitStatus
    where
        S: Produce + ?Sized,
        W: Write,
    {
        let result = self.run(step).await;
        close_template(self.publisher.template()).await;

        match result {
            Ok(published) => {
                info!(producer = %self.publisher, published, "Produce step finished");
                ExitStatus::Success
            }
            Err(e) => {
                error!(producer = %self.publisher, "Produce step failed: {:#}", e);
                if let Err(write_err) = writeln!(output, "Error occurred: {:#}", e) {
                    error!("Unable to write error output: {}", write_err);
                }
                ExitStatus::Failure
            }
        }
    }

    async fn run<S: Produce + ?Sized>(&self, step: &S) -> anyhow::Result<usize> {
        self.publisher
            .connect()
            .await
            .context("Unable to connect the producer")?;
        let published = step.produce(&self.publisher).await?;
        self.publisher.flush().await.context("Unable to flush")?;
        Ok(published)
    }
}
