use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

use crate::message::ReceivedMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConsumerEventKind {
    Received,
    Success,
    Failure,
}

impl ConsumerEventKind {
    /// The event name sinks are notified with.
    pub fn name(&self) -> &'static str {
        match self {
            ConsumerEventKind::Received => "receive",
            ConsumerEventKind::Success => "consumer.success",
            ConsumerEventKind::Failure => "consumer.error",
        }
    }
}

impl fmt::Display for ConsumerEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle notification for a single delivery.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerEvent {
    pub kind: ConsumerEventKind,
    pub consumer_tag: String,
    pub message: ReceivedMessage,
}

impl ConsumerEvent {
    pub fn new(kind: ConsumerEventKind, consumer_tag: &str, message: &ReceivedMessage) -> Self {
        ConsumerEvent {
            kind,
            consumer_tag: consumer_tag.to_string(),
            message: message.clone(),
        }
    }
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event_name: &str, event: &ConsumerEvent);
}

impl<F> EventSink for F
where
    F: Fn(&str, &ConsumerEvent) + Send + Sync,
{
    fn publish(&self, event_name: &str, event: &ConsumerEvent) {
        self(event_name, event)
    }
}

/// Writes every consumer event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event_name: &str, event: &ConsumerEvent) {
        match event.kind {
            ConsumerEventKind::Failure => warn!(
                event = event_name,
                consumer_tag = %event.consumer_tag,
                delivery_tag = event.message.delivery_tag,
                "Message handling failed"
            ),
            _ => info!(
                event = event_name,
                consumer_tag = %event.consumer_tag,
                delivery_tag = event.message.delivery_tag,
                redelivered = event.message.redelivered,
                "Consumer event"
            ),
        }
    }
}
