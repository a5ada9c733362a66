use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::message::{Message, Payload};
use crate::rabbitmq::channel::BrokerChannel;
use crate::rabbitmq::connection::AmqpConnection;
use crate::rabbitmq::encryption::Encryption;
use crate::rabbitmq::errors::{RabbitMQError, Result};
use crate::rabbitmq::events::{ConsumerEvent, EventSink};
use crate::rabbitmq::serializer::{JsonSerializer, Serializer};
use crate::rabbitmq::strategy::QueueStrategy;

/// Binds a queue to a connection, a strategy and a codec.
///
/// Consumers and producers share a template through an `Arc`. The template
/// owns at most one channel, opened on first use and kept until [`close`].
///
/// [`close`]: QueueTemplate::close
pub struct QueueTemplate {
    connection: Arc<dyn AmqpConnection>,
    strategy: QueueStrategy,
    serializer: Box<dyn Serializer>,
    encryption: Option<Box<dyn Encryption>>,
    event_sink: Option<Arc<dyn EventSink>>,
    queue_name: String,
    exchange_name: String,
    routing_key: Option<String>,
    passive: bool,
    exclusive: bool,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
    declared: AtomicBool,
}

impl QueueTemplate {
    pub fn new(
        connection: Arc<dyn AmqpConnection>,
        strategy: QueueStrategy,
        queue_name: &str,
    ) -> Self {
        QueueTemplate {
            connection,
            strategy,
            serializer: Box::new(JsonSerializer),
            encryption: None,
            event_sink: None,
            queue_name: queue_name.to_string(),
            exchange_name: String::new(),
            routing_key: None,
            passive: false,
            exclusive: false,
            channel: Mutex::new(None),
            declared: AtomicBool::new(false),
        }
    }

    pub fn with_serializer(mut self, serializer: Box<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_encryption(mut self, encryption: Box<dyn Encryption>) -> Self {
        self.encryption = Some(encryption);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn with_exchange(mut self, exchange_name: &str) -> Self {
        self.exchange_name = exchange_name.to_string();
        self
    }

    pub fn with_routing_key(mut self, routing_key: &str) -> Self {
        self.routing_key = Some(routing_key.to_string());
        self
    }

    pub fn with_passive(mut self, passive: bool) -> Self {
        self.passive = passive;
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Swaps the strategy. Refused once the queue has been declared with the current one.
    pub fn set_strategy(&mut self, strategy: QueueStrategy) -> Result<()> {
        if self.declared.load(Ordering::SeqCst) && strategy != self.strategy {
            return Err(RabbitMQError::StrategyLocked);
        }
        self.strategy = strategy;
        Ok(())
    }

    pub async fn ensure_connected(&self) -> Result<()> {
        if !self.connection.is_connected() {
            info!(queue = %self.queue_name, "Connection is down, reconnecting");
            self.connection.reconnect().await?;
        }
        Ok(())
    }

    /// The channel of this template, opened lazily.
    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut guard = self.channel.lock().await;
        if let Some(channel) = guard.as_ref() {
            return Ok(channel.clone());
        }

        self.ensure_connected().await?;
        let channel = self.connection.open_channel().await.map_err(|e| {
            RabbitMQError::ChannelError(format!(
                "Failed to create the AMQP channel. This may be related to a misconfiguration \
                 of the connection or channel: {}",
                e
            ))
        })?;

        debug!(queue = %self.queue_name, "Opened channel");
        *guard = Some(channel.clone());
        Ok(channel)
    }

    pub async fn declare_queue(&self) -> Result<()> {
        self.strategy.declare_queue(self).await?;
        self.declared.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn declare_qos(&self) -> Result<()> {
        self.strategy.declare_qos(self).await
    }

    pub fn create_message(&self, data: &Payload) -> Result<Message> {
        self.strategy.create_message(self, data)
    }

    pub fn do_ack_manually(&self) -> bool {
        self.strategy.do_ack_manually()
    }

    /// Serializes, then encrypts when an encryption is configured.
    pub fn encode(&self, data: &Payload) -> Result<Vec<u8>> {
        let body = self.serializer.serialize(data)?;
        match &self.encryption {
            Some(encryption) => encryption.encrypt(&body),
            None => Ok(body),
        }
    }

    /// Inverse of [`encode`](QueueTemplate::encode). Any failure is a deserialization error.
    pub fn decode(&self, body: &[u8]) -> Result<Payload> {
        let plain = match &self.encryption {
            Some(encryption) => encryption
                .decrypt(body)
                .map_err(|e| RabbitMQError::DeserializationError(e.to_string()))?,
            None => body.to_vec(),
        };
        self.serializer.deserialize(&plain)
    }

    /// Returns false when no sink is set.
    pub fn dispatch_event(&self, event_name: &str, event: &ConsumerEvent) -> bool {
        match &self.event_sink {
            Some(sink) => {
                sink.publish(event_name, event);
                true
            }
            None => false,
        }
    }

    pub fn connection(&self) -> &Arc<dyn AmqpConnection> {
        &self.connection
    }

    pub fn strategy(&self) -> QueueStrategy {
        self.strategy
    }

    pub fn content_type(&self) -> &'static str {
        self.serializer.content_type()
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    /// Explicit routing key, or the queue name for the default exchange.
    pub fn routing_key(&self) -> &str {
        self.routing_key.as_deref().unwrap_or(&self.queue_name)
    }

    pub fn is_passive(&self) -> bool {
        self.passive
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_declared(&self) -> bool {
        self.declared.load(Ordering::SeqCst)
    }

    /// Closes the channel, then the connection.
    pub async fn close(&self) -> Result<()> {
        if let Some(channel) = self.channel.lock().await.take() {
            if let Err(e) = channel.close().await {
                error!(queue = %self.queue_name, "Failed to close channel: {}", e);
            }
        }
        self.connection.close().await
    }
}
