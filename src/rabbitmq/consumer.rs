use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::message::{Delivery, ReceivedMessage};
use crate::rabbitmq::channel::Subscription;
use crate::rabbitmq::errors::{HandlerFailure, RabbitMQError, Result};
use crate::rabbitmq::events::{ConsumerEvent, ConsumerEventKind};
use crate::rabbitmq::template::QueueTemplate;

/// Application logic run for every delivery.
///
/// `Ok(true)` acknowledges the message. `Ok(false)`, an error or a panic count
/// as a failed delivery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &ReceivedMessage) -> anyhow::Result<bool>;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(&ReceivedMessage) -> anyhow::Result<bool> + Send + Sync,
{
    async fn handle(&self, message: &ReceivedMessage) -> anyhow::Result<bool> {
        self(message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Listening,
    Dispatching,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Delivered(DeliveryOutcome),
    TimedOut,
    Closed,
}

pub struct Consumer<H> {
    template: Arc<QueueTemplate>,
    handler: H,
    consumer_tag: String,
    no_local: bool,
    no_wait: bool,
    state: ConsumerState,
    listened: bool,
}

impl<H: MessageHandler> Consumer<H> {
    /// An empty tag is replaced by a generated `consumer-<uuid>`.
    pub fn new(template: Arc<QueueTemplate>, handler: H, consumer_tag: &str) -> Self {
        let consumer_tag = if consumer_tag.is_empty() {
            format!("consumer-{}", Uuid::new_v4())
        } else {
            consumer_tag.to_string()
        };

        Consumer {
            template,
            handler,
            consumer_tag,
            no_local: false,
            no_wait: false,
            state: ConsumerState::Idle,
            listened: false,
        }
    }

    pub fn with_no_local(mut self, no_local: bool) -> Self {
        self.no_local = no_local;
        self
    }

    pub fn with_no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }

    /// Connects and declares the queue and its QoS. Failures are logged, not returned.
    pub async fn connect(&self) -> bool {
        match self.declare_topology().await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    queue = %self.template.queue_name(),
                    consumer_tag = %self.consumer_tag,
                    "Failed to connect consumer: {}", e
                );
                false
            }
        }
    }

    async fn declare_topology(&self) -> Result<()> {
        self.template.ensure_connected().await?;
        self.template.declare_queue().await?;
        self.template.declare_qos().await
    }

    /// Registers the subscription. Only once per consumer, even after `cancel`.
    pub async fn listen(&mut self) -> Result<()> {
        if self.listened {
            return Err(RabbitMQError::AlreadyListening(self.consumer_tag.clone()));
        }

        let subscription = Subscription {
            queue: self.template.queue_name().to_string(),
            consumer_tag: self.consumer_tag.clone(),
            no_local: self.no_local,
            no_ack: !self.template.do_ack_manually(),
            exclusive: self.template.is_exclusive(),
            no_wait: self.no_wait,
        };

        let channel = self.template.channel().await?;
        channel.subscribe(&subscription).await?;
        self.listened = true;
        self.state = ConsumerState::Listening;

        info!(
            queue = %subscription.queue,
            consumer_tag = %self.consumer_tag,
            no_ack = subscription.no_ack,
            "Consumer is listening"
        );
        Ok(())
    }

    /// Decodes a delivery, runs the handler and settles the message.
    pub async fn dispatch(&mut self, delivery: Delivery) -> Result<DeliveryOutcome> {
        let previous = self.state;
        self.state = ConsumerState::Dispatching;
        let result = self.process(delivery).await;
        self.state = previous;
        result
    }

    async fn process(&self, delivery: Delivery) -> Result<DeliveryOutcome> {
        let delivery_tag = delivery.delivery_tag;
        let body = self.template.decode(&delivery.body).inspect_err(|e| {
            error!(delivery_tag, consumer_tag = %self.consumer_tag, "Failed to decode message: {}", e);
        })?;
        let message = ReceivedMessage::new(delivery, body);

        self.emit(ConsumerEventKind::Received, &message);

        let outcome = match self.invoke_handler(&message).await {
            Ok(()) => DeliveryOutcome::Success,
            Err(failure) => {
                warn!(delivery_tag, consumer_tag = %self.consumer_tag, "{}", failure);
                DeliveryOutcome::Failure
            }
        };

        let manual = self.template.do_ack_manually();
        match outcome {
            DeliveryOutcome::Success => {
                if manual {
                    self.template.channel().await?.ack(delivery_tag, false).await?;
                }
                self.emit(ConsumerEventKind::Success, &message);
            }
            DeliveryOutcome::Failure => {
                if manual {
                    self.template
                        .channel()
                        .await?
                        .nack(delivery_tag, false, true)
                        .await?;
                }
                self.emit(ConsumerEventKind::Failure, &message);
            }
        }

        debug!(delivery_tag, ?outcome, "Delivery settled");
        Ok(outcome)
    }

    /// Runs the handler and folds every way it can fail into a `HandlerFailure`.
    pub async fn invoke_handler(
        &self,
        message: &ReceivedMessage,
    ) -> std::result::Result<(), HandlerFailure> {
        match AssertUnwindSafe(self.handler.handle(message))
            .catch_unwind()
            .await
        {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(HandlerFailure::Rejected),
            Ok(Err(e)) => Err(HandlerFailure::Errored(e)),
            Err(panic) => Err(HandlerFailure::Panicked(panic_message(panic.as_ref()))),
        }
    }

    fn emit(&self, kind: ConsumerEventKind, message: &ReceivedMessage) {
        let event = ConsumerEvent::new(kind, &self.consumer_tag, message);
        self.template.dispatch_event(kind.name(), &event);
    }

    /// Waits for one delivery and dispatches it.
    ///
    /// Without a timeout this blocks until the broker delivers or the subscription ends.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<WaitOutcome> {
        let channel = self.template.channel().await?;

        let pending = channel.wait_for_delivery(&self.consumer_tag);
        let next = match timeout {
            Some(limit) => match tokio::time::timeout(limit, pending).await {
                Ok(next) => next?,
                Err(_) => return Ok(WaitOutcome::TimedOut),
            },
            None => pending.await?,
        };

        match next {
            Some(delivery) => Ok(WaitOutcome::Delivered(self.dispatch(delivery).await?)),
            None => {
                info!(consumer_tag = %self.consumer_tag, "Subscription closed");
                self.state = ConsumerState::Idle;
                Ok(WaitOutcome::Closed)
            }
        }
    }

    /// True while the channel still has an active subscription.
    pub async fn is_busy(&self) -> bool {
        match self.template.channel().await {
            Ok(channel) => channel.subscription_count() > 0,
            Err(e) => {
                warn!("Unable to inspect consumer channel: {}", e);
                false
            }
        }
    }

    pub async fn cancel(&mut self) -> Result<()> {
        if self.state == ConsumerState::Idle {
            return Ok(());
        }

        self.template.channel().await?.cancel(&self.consumer_tag).await?;
        self.state = ConsumerState::Idle;
        info!(consumer_tag = %self.consumer_tag, "Consumer cancelled");
        Ok(())
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn template(&self) -> &Arc<QueueTemplate> {
        &self.template
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
