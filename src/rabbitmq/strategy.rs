use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::message::{DeliveryMode, Message, Payload};
use crate::rabbitmq::channel::{QosOptions, QueueOptions};
use crate::rabbitmq::errors::{RabbitMQError, Result};
use crate::rabbitmq::template::QueueTemplate;

/// How queues are declared, how deliveries are acknowledged and whether messages persist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStrategy {
    /// Transient queue, broker-side acknowledgement, transient messages.
    #[default]
    Basic,
    /// Durable queue, explicit ack/nack by the consumer, persistent messages.
    FaultTolerant,
}

/// Static policy table, one per strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyProfile {
    pub durable: bool,
    pub auto_delete: bool,
    pub prefetch_count: u16,
    pub global_qos: bool,
    pub ack_manually: bool,
    pub delivery_mode: DeliveryMode,
}

const BASIC: StrategyProfile = StrategyProfile {
    durable: false,
    auto_delete: true,
    prefetch_count: 1,
    global_qos: false,
    ack_manually: false,
    delivery_mode: DeliveryMode::Transient,
};

const FAULT_TOLERANT: StrategyProfile = StrategyProfile {
    durable: true,
    auto_delete: false,
    prefetch_count: 1,
    global_qos: true,
    ack_manually: true,
    delivery_mode: DeliveryMode::Persistent,
};

impl QueueStrategy {
    pub fn profile(&self) -> &'static StrategyProfile {
        match self {
            QueueStrategy::Basic => &BASIC,
            QueueStrategy::FaultTolerant => &FAULT_TOLERANT,
        }
    }

    pub fn queue_options(&self, passive: bool, exclusive: bool) -> QueueOptions {
        let profile = self.profile();
        QueueOptions {
            passive,
            durable: profile.durable,
            exclusive,
            auto_delete: profile.auto_delete,
        }
    }

    pub fn qos(&self) -> QosOptions {
        let profile = self.profile();
        QosOptions {
            prefetch_size: 0,
            prefetch_count: profile.prefetch_count,
            global: profile.global_qos,
        }
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.profile().delivery_mode
    }

    /// Whether the consumer must send ack/nack itself.
    pub fn do_ack_manually(&self) -> bool {
        self.profile().ack_manually
    }

    pub async fn declare_queue(&self, template: &QueueTemplate) -> Result<()> {
        let channel = template.channel().await?;
        let options = self.queue_options(template.is_passive(), template.is_exclusive());

        debug!(queue = template.queue_name(), strategy = %self, ?options, "Declaring queue");
        channel.declare_queue(template.queue_name(), options).await
    }

    pub async fn declare_qos(&self, template: &QueueTemplate) -> Result<()> {
        let channel = template.channel().await?;
        let qos = self.qos();

        debug!(queue = template.queue_name(), strategy = %self, ?qos, "Declaring quality of service");
        channel.set_qos(qos).await.map_err(|e| match e {
            RabbitMQError::TopologyError { queue, reason } if queue.is_empty() => {
                RabbitMQError::TopologyError {
                    queue: template.queue_name().to_string(),
                    reason,
                }
            }
            other => other,
        })
    }

    pub fn create_message(&self, template: &QueueTemplate, data: &Payload) -> Result<Message> {
        let body = template.encode(data)?;
        Ok(Message::new(body, template.content_type()).with_delivery_mode(self.delivery_mode()))
    }
}

impl fmt::Display for QueueStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueStrategy::Basic => write!(f, "basic"),
            QueueStrategy::FaultTolerant => write!(f, "fault_tolerant"),
        }
    }
}

impl FromStr for QueueStrategy {
    type Err = RabbitMQError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "basic" => Ok(QueueStrategy::Basic),
            "fault_tolerant" | "faulttolerant" => Ok(QueueStrategy::FaultTolerant),
            other => Err(RabbitMQError::ConfigError(format!(
                "unknown queue strategy '{}', expected 'basic' or 'fault_tolerant'",
                other
            ))),
        }
    }
}
