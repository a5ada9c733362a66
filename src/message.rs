use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The mapping of arbitrary data carried by every message.
pub type Payload = Map<String, Value>;

pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum DeliveryMode {
    #[default]
    Transient,
    Persistent,
}

impl DeliveryMode {
    /// AMQP `delivery-mode` property value.
    pub fn as_u8(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

/// An outbound message: encoded body plus the properties the broker needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub body: Vec<u8>,
    pub delivery_mode: DeliveryMode,
    pub content_type: String,
}

impl Message {
    pub fn new(body: Vec<u8>, content_type: impl Into<String>) -> Self {
        Message {
            body,
            delivery_mode: DeliveryMode::Transient,
            content_type: content_type.into(),
        }
    }

    pub fn with_delivery_mode(mut self, delivery_mode: DeliveryMode) -> Self {
        self.delivery_mode = delivery_mode;
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == DeliveryMode::Persistent
    }
}

/// A raw delivery handed out by the broker channel, body still encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, body: Vec<u8>) -> Self {
        Delivery {
            delivery_tag,
            redelivered: false,
            exchange: String::new(),
            routing_key: String::new(),
            body,
        }
    }
}

/// A delivery after decoding; this is what handlers and event sinks receive.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ReceivedMessage {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub received_at: DateTime<Utc>,
    pub body: Payload,
}

impl ReceivedMessage {
    pub fn new(delivery: Delivery, body: Payload) -> Self {
        ReceivedMessage {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            received_at: Utc::now(),
            body,
        }
    }

    /// Looks up a top-level field of the decoded body.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// Convenience accessor for string fields such as `message`.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }
}
