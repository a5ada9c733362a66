pub mod config;
pub mod env;
pub mod message;
pub mod rabbitmq;

pub use message::{Delivery, DeliveryMode, Message, Payload, ReceivedMessage};
pub use rabbitmq::*;
