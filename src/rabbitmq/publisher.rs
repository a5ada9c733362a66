use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::message::Payload;
use crate::rabbitmq::errors::{PublishError, RabbitMQError, Result};
use crate::rabbitmq::template::QueueTemplate;

#[async_trait]
pub trait Publisher: Send + Sync + fmt::Display {
    /// Makes sure the connection is up and the queue exists. No QoS is declared for producers.
    async fn connect(&self) -> Result<()> {
        let template = self.template();
        template.ensure_connected().await?;
        template.declare_queue().await
    }

    /// On failure the payload is handed back inside the error.
    async fn publish(&self, data: Payload) -> std::result::Result<(), PublishError>;

    /// Sends whatever is still buffered and returns how many messages went out.
    async fn flush(&self) -> Result<usize> {
        Ok(0)
    }

    fn template(&self) -> &Arc<QueueTemplate>;
}

fn publish_failed(producer: &dyn fmt::Display, data: Payload, cause: RabbitMQError) -> PublishError {
    error!(producer = %producer, "Failed to publish message: {}", cause);
    PublishError::new(producer.to_string(), data, cause)
}

/// Publishes every message immediately.
pub struct Producer {
    template: Arc<QueueTemplate>,
}

impl Producer {
    pub fn new(template: Arc<QueueTemplate>) -> Self {
        Producer { template }
    }

    async fn send(&self, data: &Payload) -> Result<()> {
        let message = self.template.create_message(data)?;
        let channel = self.template.channel().await?;
        channel
            .publish(
                &message,
                self.template.exchange_name(),
                self.template.routing_key(),
            )
            .await
    }
}

impl fmt::Display for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "producer[{}]", self.template.queue_name())
    }
}

#[async_trait]
impl Publisher for Producer {
    async fn publish(&self, data: Payload) -> std::result::Result<(), PublishError> {
        match self.send(&data).await {
            Ok(()) => {
                debug!(producer = %self, "Message published");
                Ok(())
            }
            Err(e) => Err(publish_failed(self, data, e)),
        }
    }

    fn template(&self) -> &Arc<QueueTemplate> {
        &self.template
    }
}

/// Stages messages on the channel until [`commit`](BatchProducer::commit).
pub struct BatchProducer {
    template: Arc<QueueTemplate>,
    pending: AtomicUsize,
}

impl BatchProducer {
    pub fn new(template: Arc<QueueTemplate>) -> Self {
        BatchProducer {
            template,
            pending: AtomicUsize::new(0),
        }
    }

    async fn stage(&self, data: &Payload) -> Result<()> {
        let message = self.template.create_message(data)?;
        let channel = self.template.channel().await?;
        channel
            .batch_publish(
                message,
                self.template.exchange_name(),
                self.template.routing_key(),
            )
            .await
    }

    /// Flushes the staged messages to the broker in one go.
    pub async fn commit(&self) -> Result<usize> {
        let channel = self.template.channel().await?;
        let sent = channel.commit_batch().await?;
        self.pending.store(0, Ordering::SeqCst);

        info!(producer = %self, sent, "Batch committed");
        Ok(sent)
    }

    /// Messages staged since the last commit.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

impl fmt::Display for BatchProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch-producer[{}]", self.template.queue_name())
    }
}

#[async_trait]
impl Publisher for BatchProducer {
    async fn publish(&self, data: Payload) -> std::result::Result<(), PublishError> {
        match self.stage(&data).await {
            Ok(()) => {
                let pending = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(producer = %self, pending, "Message staged");
                Ok(())
            }
            Err(e) => Err(publish_failed(self, data, e)),
        }
    }

    async fn flush(&self) -> Result<usize> {
        self.commit().await
    }

    fn template(&self) -> &Arc<QueueTemplate> {
        &self.template
    }
}
