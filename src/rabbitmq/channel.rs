use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Consumer,
};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::message::{Delivery, Message};
use crate::rabbitmq::errors::{RabbitMQError, Result};

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// `basic.qos` settings. A prefetch size of 0 means no byte limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QosOptions {
    pub prefetch_size: u32,
    pub prefetch_count: u16,
    pub global: bool,
}

/// Everything `basic.consume` needs to register one consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscription {
    pub queue: String,
    pub consumer_tag: String,
    pub no_local: bool,
    pub no_ack: bool,
    pub exclusive: bool,
    pub no_wait: bool,
}

/// The broker operations the strategy, consumers and producers rely on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()>;

    async fn set_qos(&self, qos: QosOptions) -> Result<()>;

    async fn subscribe(&self, subscription: &Subscription) -> Result<()>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Number of active subscriptions on this channel.
    fn subscription_count(&self) -> usize;

    async fn publish(&self, message: &Message, exchange: &str, routing_key: &str) -> Result<()>;

    /// Stages a message; nothing reaches the broker before `commit_batch`.
    async fn batch_publish(&self, message: Message, exchange: &str, routing_key: &str)
        -> Result<()>;

    /// Flushes the staged batch and returns how many messages were sent.
    async fn commit_batch(&self) -> Result<usize>;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()>;

    /// Waits for the next delivery of the subscription registered under `consumer_tag`.
    /// `None` once that subscription is gone.
    async fn wait_for_delivery(&self, consumer_tag: &str) -> Result<Option<Delivery>>;

    async fn close(&self) -> Result<()>;
}

struct StagedMessage {
    message: Message,
    exchange: String,
    routing_key: String,
}

/// Messages waiting for the next transaction.
#[derive(Default)]
struct StagedBatch {
    messages: Mutex<Vec<StagedMessage>>,
}

impl StagedBatch {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<StagedMessage>>> {
        self.messages
            .lock()
            .map_err(|_| RabbitMQError::ChannelError("batch buffer lock poisoned".to_string()))
    }

    fn push(&self, staged: StagedMessage) -> Result<()> {
        self.lock()?.push(staged);
        Ok(())
    }

    fn take(&self) -> Result<Vec<StagedMessage>> {
        Ok(std::mem::take(&mut *self.lock()?))
    }

    /// Puts an unsent batch back in front of anything staged since it was taken.
    fn restore(&self, mut batch: Vec<StagedMessage>) -> Result<()> {
        let mut guard = self.lock()?;
        batch.append(&mut guard);
        *guard = batch;
        Ok(())
    }

    fn len(&self) -> usize {
        self.lock().map(|guard| guard.len()).unwrap_or(0)
    }
}

type SharedConsumer = Arc<tokio::sync::Mutex<Consumer>>;

/// `BrokerChannel` backed by a lapin channel.
pub struct LapinChannel {
    channel: Channel,
    consumers: Mutex<Vec<(String, SharedConsumer)>>,
    active: AtomicUsize,
    staged: StagedBatch,
    transactional: AtomicBool,
}

impl LapinChannel {
    pub fn new(channel: Channel) -> Self {
        debug!(channel_id = channel.id(), "Creating lapin broker channel");
        Self {
            channel,
            consumers: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            staged: StagedBatch::default(),
            transactional: AtomicBool::new(false),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.channel.status().connected()
    }

    fn properties(message: &Message) -> BasicProperties {
        BasicProperties::default()
            .with_message_id(Uuid::new_v4().to_string().into())
            .with_content_type(message.content_type.as_str().into())
            .with_delivery_mode(message.delivery_mode.as_u8())
            .with_timestamp(chrono::Utc::now().timestamp() as u64)
    }

    async fn send(&self, message: &Message, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                Self::properties(message),
            )
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to publish: {}", e)))?
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Publish not confirmed: {}", e)))?;

        Ok(())
    }

    fn subscriptions(&self) -> Result<std::sync::MutexGuard<'_, Vec<(String, SharedConsumer)>>> {
        self.consumers
            .lock()
            .map_err(|_| RabbitMQError::ConsumeError("consumer list lock poisoned".to_string()))
    }

    fn find_consumer(&self, consumer_tag: &str) -> Result<Option<SharedConsumer>> {
        Ok(self
            .subscriptions()?
            .iter()
            .find(|(tag, _)| tag == consumer_tag)
            .map(|(_, consumer)| consumer.clone()))
    }

    fn forget_consumer(&self, consumer_tag: &str) -> Result<()> {
        let mut consumers = self.subscriptions()?;
        let before = consumers.len();
        consumers.retain(|(tag, _)| tag != consumer_tag);
        self.active
            .fetch_sub(before - consumers.len(), Ordering::SeqCst);
        Ok(())
    }

    /// Sends a batch inside one AMQP transaction.
    async fn send_batch(&self, batch: &[StagedMessage]) -> Result<()> {
        if !self.transactional.load(Ordering::SeqCst) {
            self.channel
                .tx_select()
                .await
                .map_err(|e| RabbitMQError::ChannelError(format!("tx.select failed: {}", e)))?;
            self.transactional.store(true, Ordering::SeqCst);
        }

        for staged in batch {
            if let Err(e) = self
                .send(&staged.message, &staged.exchange, &staged.routing_key)
                .await
            {
                error!("Batch publish failed, rolling back: {}", e);
                if let Err(rollback) = self.channel.tx_rollback().await {
                    error!("Failed to roll back batch: {}", rollback);
                }
                return Err(e);
            }
        }

        self.channel
            .tx_commit()
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("tx.commit failed: {}", e)))
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        info!("About to declare queue: {}", name);

        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: options.passive,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::topology(name, e))?;

        info!(
            "Queue '{}' declared with {} messages",
            name,
            queue.message_count()
        );
        Ok(())
    }

    async fn set_qos(&self, qos: QosOptions) -> Result<()> {
        if qos.prefetch_size != 0 {
            warn!(
                prefetch_size = qos.prefetch_size,
                "Prefetch size is not supported by the broker client, ignoring it"
            );
        }

        self.channel
            .basic_qos(qos.prefetch_count, BasicQosOptions { global: qos.global })
            .await
            .map_err(|e| RabbitMQError::TopologyError {
                queue: String::new(),
                reason: format!("Failed to set QoS: {}", e),
            })
    }

    async fn subscribe(&self, subscription: &Subscription) -> Result<()> {
        let consumer = self
            .channel
            .basic_consume(
                &subscription.queue,
                &subscription.consumer_tag,
                BasicConsumeOptions {
                    no_local: subscription.no_local,
                    no_ack: subscription.no_ack,
                    exclusive: subscription.exclusive,
                    nowait: subscription.no_wait,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        info!(
            consumer_tag = %consumer.tag(),
            "Started consuming from queue: {}", subscription.queue
        );

        let tag = consumer.tag().to_string();
        self.subscriptions()?
            .push((tag, Arc::new(tokio::sync::Mutex::new(consumer))));
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        self.forget_consumer(consumer_tag)
    }

    fn subscription_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    async fn publish(&self, message: &Message, exchange: &str, routing_key: &str) -> Result<()> {
        self.send(message, exchange, routing_key).await?;
        debug!(
            "Published message to exchange '{}' with routing key '{}'",
            exchange, routing_key
        );
        Ok(())
    }

    async fn batch_publish(
        &self,
        message: Message,
        exchange: &str,
        routing_key: &str,
    ) -> Result<()> {
        self.staged.push(StagedMessage {
            message,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        })
    }

    async fn commit_batch(&self) -> Result<usize> {
        let batch = self.staged.take()?;
        if batch.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self.send_batch(&batch).await {
            let kept = batch.len();
            self.staged.restore(batch)?;
            warn!(kept, staged = self.staged.len(), "Batch kept for the next commit");
            return Err(e);
        }

        info!(count = batch.len(), "Committed message batch");
        Ok(batch.len())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn wait_for_delivery(&self, consumer_tag: &str) -> Result<Option<Delivery>> {
        let Some(consumer) = self.find_consumer(consumer_tag)? else {
            return Ok(None);
        };

        let next = consumer.lock().await.next().await;
        match next {
            Some(Ok(delivery)) => Ok(Some(Delivery {
                delivery_tag: delivery.delivery_tag,
                redelivered: delivery.redelivered,
                exchange: delivery.exchange.to_string(),
                routing_key: delivery.routing_key.to_string(),
                body: delivery.data,
            })),
            Some(Err(e)) => {
                error!(consumer_tag, "Error receiving message: {}", e);
                if !self.channel.status().connected() {
                    return Err(RabbitMQError::ConnectionError(e.to_string()));
                }
                Err(RabbitMQError::ConsumeError(e.to_string()))
            }
            None => {
                warn!(consumer_tag, "Subscription ended");
                self.forget_consumer(consumer_tag)?;
                Ok(None)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.subscriptions()?.clear();
        self.active.store(0, Ordering::SeqCst);

        if !self.channel.status().connected() {
            return Ok(());
        }

        self.channel
            .close(200, "Closing channel")
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))
    }
}
