use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rabbit_strategy::{
    AmqpConnection, BrokerChannel, Delivery, Message, Payload, QosOptions, QueueOptions,
    RabbitMQError, Result, Subscription,
};
use tokio::sync::Notify;

/// Single-queue broker kept in memory. Published messages become deliveries.
#[derive(Default)]
pub struct InMemoryChannel {
    pub declared: Mutex<Vec<(String, QueueOptions)>>,
    pub qos: Mutex<Vec<QosOptions>>,
    pub subscriptions: Mutex<Vec<Subscription>>,
    pub published: Mutex<Vec<Message>>,
    pub staged: Mutex<Vec<(Message, String, String)>>,
    pub commits: Mutex<Vec<usize>>,
    pub acks: Mutex<Vec<u64>>,
    pub nacks: Mutex<Vec<(u64, bool)>>,
    pub closed: AtomicBool,
    pub fail_next_commit: AtomicBool,
    ready: Mutex<VecDeque<Delivery>>,
    arrived: Notify,
    next_tag: AtomicU64,
    active: AtomicUsize,
}

impl InMemoryChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn route(&self, message: &Message, exchange: &str, routing_key: &str) {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let mut delivery = Delivery::new(tag, message.body.clone());
        delivery.exchange = exchange.to_string();
        delivery.routing_key = routing_key.to_string();

        self.published.lock().unwrap().push(message.clone());
        self.ready.lock().unwrap().push_back(delivery);
        self.arrived.notify_one();
    }

    pub fn ready_count(&self) -> usize {
        self.ready.lock().unwrap().len()
    }

    fn pop(&self) -> Option<Delivery> {
        self.ready.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        let mut declared = self.declared.lock().unwrap();
        if let Some((_, existing)) = declared.iter().find(|(queue, _)| queue == name) {
            if existing.durable != options.durable {
                return Err(RabbitMQError::TopologyError {
                    queue: name.to_string(),
                    reason: "PRECONDITION_FAILED - inequivalent arg 'durable'".to_string(),
                });
            }
        }
        declared.push((name.to_string(), options));
        Ok(())
    }

    async fn set_qos(&self, qos: QosOptions) -> Result<()> {
        self.qos.lock().unwrap().push(qos);
        Ok(())
    }

    async fn subscribe(&self, subscription: &Subscription) -> Result<()> {
        self.subscriptions.lock().unwrap().push(subscription.clone());
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.consumer_tag != consumer_tag);
        self.active
            .fetch_sub(before - subscriptions.len(), Ordering::SeqCst);
        Ok(())
    }

    fn subscription_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    async fn publish(&self, message: &Message, exchange: &str, routing_key: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RabbitMQError::ChannelError("channel is closed".to_string()));
        }
        self.route(message, exchange, routing_key);
        Ok(())
    }

    async fn batch_publish(&self, message: Message, exchange: &str, routing_key: &str) -> Result<()> {
        self.staged
            .lock()
            .unwrap()
            .push((message, exchange.to_string(), routing_key.to_string()));
        Ok(())
    }

    async fn commit_batch(&self) -> Result<usize> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(RabbitMQError::ChannelError("tx.commit failed".to_string()));
        }
        let batch: Vec<(Message, String, String)> = std::mem::take(&mut *self.staged.lock().unwrap());
        for (message, exchange, routing_key) in &batch {
            self.route(message, exchange, routing_key);
        }
        self.commits.lock().unwrap().push(batch.len());
        Ok(batch.len())
    }

    async fn ack(&self, delivery_tag: u64, _multiple: bool) -> Result<()> {
        self.acks.lock().unwrap().push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, _multiple: bool, requeue: bool) -> Result<()> {
        self.nacks.lock().unwrap().push((delivery_tag, requeue));
        Ok(())
    }

    async fn wait_for_delivery(&self, consumer_tag: &str) -> Result<Option<Delivery>> {
        loop {
            let subscribed = self
                .subscriptions
                .lock()
                .unwrap()
                .iter()
                .any(|s| s.consumer_tag == consumer_tag);
            if !subscribed {
                return Ok(None);
            }
            if let Some(delivery) = self.pop() {
                return Ok(Some(delivery));
            }
            self.arrived.notified().await;
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.subscriptions.lock().unwrap().clear();
        self.active.store(0, Ordering::SeqCst);
        Ok(())
    }
}

/// Connection that always hands out the same in-memory channel.
pub struct FakeConnection {
    pub channel: Arc<InMemoryChannel>,
    pub connected: AtomicBool,
    pub reachable: bool,
    pub reconnects: AtomicUsize,
    pub closes: AtomicUsize,
}

impl FakeConnection {
    pub fn new(channel: Arc<InMemoryChannel>) -> Arc<Self> {
        Arc::new(FakeConnection {
            channel,
            connected: AtomicBool::new(false),
            reachable: true,
            reconnects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn unreachable(channel: Arc<InMemoryChannel>) -> Arc<Self> {
        Arc::new(FakeConnection {
            channel,
            connected: AtomicBool::new(false),
            reachable: false,
            reconnects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl AmqpConnection for FakeConnection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        if !self.reachable {
            return Err(RabbitMQError::ConnectionError("connection refused".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if !self.is_connected() {
            return Err(RabbitMQError::ConnectionError("No active connection".to_string()));
        }
        let channel: Arc<dyn BrokerChannel> = self.channel.clone();
        Ok(channel)
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub fn payload(message: &str) -> Payload {
    let mut data = Payload::new();
    data.insert("message".to_string(), serde_json::Value::String(message.to_string()));
    data
}
