// src/rabbitmq/errors.rs

use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

use crate::message::Payload;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Failed to declare topology for queue '{queue}': {reason}")]
    TopologyError { queue: String, reason: String },

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Message deserialization error: {0}")]
    DeserializationError(String),

    #[error("Message encryption error: {0}")]
    EncryptionError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Consumer '{0}' is already listening")]
    AlreadyListening(String),

    #[error("The queue strategy cannot change after the queue has been declared")]
    StrategyLocked,

    #[error("Timeout: {0}")]
    TimeoutError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

/// Raised by a producer when a message could not be published. The original
/// payload travels with the error so the caller can retry or log it.
#[derive(Debug, Error)]
#[error("The producer {producer} is unable to publish the given message")]
pub struct PublishError {
    producer: String,
    data: Payload,
    #[source]
    source: Box<RabbitMQError>,
}

impl PublishError {
    pub fn new(producer: impl Into<String>, data: Payload, source: RabbitMQError) -> Self {
        Self {
            producer: producer.into(),
            data,
            source: Box::new(source),
        }
    }

    pub fn producer(&self) -> &str {
        &self.producer
    }

    pub fn data(&self) -> &Payload {
        &self.data
    }

    pub fn into_data(self) -> Payload {
        self.data
    }

    pub fn cause(&self) -> &RabbitMQError {
        &self.source
    }
}

/// Why a handler invocation counted as a failure. Never propagated past the consumer.
#[derive(Debug, Error)]
pub enum HandlerFailure {
    #[error("handler rejected the message")]
    Rejected,

    #[error("handler returned an error: {0}")]
    Errored(#[from] anyhow::Error),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::TimeoutError("Operation timed out".to_string())
    }
}

impl From<std::env::VarError> for RabbitMQError {
    fn from(err: std::env::VarError) -> Self {
        RabbitMQError::ConfigError(format!("Environment variable error: {}", err))
    }
}

impl From<std::num::ParseIntError> for RabbitMQError {
    fn from(err: std::num::ParseIntError) -> Self {
        RabbitMQError::ConfigError(format!("Parse error: {}", err))
    }
}

impl RabbitMQError {
    pub(crate) fn topology(queue: &str, err: impl std::fmt::Display) -> Self {
        RabbitMQError::TopologyError {
            queue: queue.to_string(),
            reason: err.to_string(),
        }
    }
}
