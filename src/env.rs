use std::env;
use std::time::Duration;

use dotenv::dotenv;

use crate::rabbitmq::errors::Result;
use crate::rabbitmq::strategy::QueueStrategy;

/// Settings taken from the environment (and `.env`). Unset variables stay `None`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EnvOverrides {
    pub amqp_addr: Option<String>,
    pub queue: Option<String>,
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    pub strategy: Option<QueueStrategy>,
    pub consumer_tag: Option<String>,
    pub interval_seconds: Option<u64>,
    pub connect_timeout_seconds: Option<u64>,
    pub secret_key: Option<String>,
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

impl EnvOverrides {
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::from_env()
    }

    pub fn from_env() -> Result<Self> {
        Ok(EnvOverrides {
            amqp_addr: var("AMQP_ADDR"),
            queue: var("RABBITMQ_QUEUE"),
            exchange: var("RABBITMQ_EXCHANGE"),
            routing_key: var("RABBITMQ_ROUTING_KEY"),
            strategy: match var("RABBITMQ_STRATEGY") {
                Some(val) => Some(val.parse()?),
                None => None,
            },
            consumer_tag: var("RABBITMQ_CONSUMER_TAG"),
            interval_seconds: match var("RABBITMQ_INTERVAL_SECONDS") {
                Some(val) => Some(val.trim().parse()?),
                None => None,
            },
            connect_timeout_seconds: match var("RABBITMQ_CONNECT_TIMEOUT_SECONDS") {
                Some(val) => Some(val.trim().parse()?),
                None => None,
            },
            secret_key: var("RABBITMQ_SECRET_KEY"),
        })
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_seconds.map(Duration::from_secs)
    }
}
