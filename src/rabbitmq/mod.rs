// src/rabbitmq/mod.rs
// Queue strategies, consumers and producers on top of lapin

pub mod errors;
pub mod channel;
pub mod connection;
pub mod serializer;
pub mod encryption;
pub mod events;
pub mod strategy;
pub mod template;
pub mod consumer;
pub mod publisher;
pub mod command;

// Re-export specific items to simplify imports elsewhere
pub use channel::{BrokerChannel, LapinChannel, QosOptions, QueueOptions, Subscription};
pub use command::{
    ConsoleProduce, ConsumerCommand, CycleHooks, ExitStatus, Pacing, Produce, ProducerCommand,
    RunOptions, StopHandle,
};
pub use connection::{AmqpConnection, ConnectionManager};
pub use consumer::{Consumer, ConsumerState, DeliveryOutcome, MessageHandler, WaitOutcome};
pub use encryption::{Aes256GcmEncryption, Encryption};
pub use errors::{HandlerFailure, PublishError, RabbitMQError, Result};
pub use events::{ConsumerEvent, ConsumerEventKind, EventSink, TracingEventSink};
pub use publisher::{BatchProducer, Producer, Publisher};
pub use serializer::{JsonSerializer, Serializer};
pub use strategy::{QueueStrategy, StrategyProfile};
pub use template::QueueTemplate;
