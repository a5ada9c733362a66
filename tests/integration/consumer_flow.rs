use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rabbit_strategy::{
    Aes256GcmEncryption, Consumer, ConsumerCommand, ConsumerEvent, DeliveryOutcome, EventSink,
    ExitStatus, Producer, Publisher, QueueStrategy, QueueTemplate, RabbitMQError,
    ReceivedMessage, RunOptions, StopHandle, WaitOutcome,
};

use crate::support::{payload, FakeConnection, InMemoryChannel};

fn template(connection: Arc<FakeConnection>, strategy: QueueStrategy) -> Arc<QueueTemplate> {
    Arc::new(QueueTemplate::new(connection, strategy, "orders"))
}

fn reject_bad(message: &ReceivedMessage) -> anyhow::Result<bool> {
    Ok(message.get_str("message") != Some("bad"))
}

#[tokio::test]
async fn test_fault_tolerant_consumer_acks_good_and_requeues_bad() {
    let channel = InMemoryChannel::new();
    let connection = FakeConnection::new(channel.clone());
    let template = template(connection.clone(), QueueStrategy::FaultTolerant);

    let producer = Producer::new(template.clone());
    producer.connect().await.unwrap();
    producer.publish(payload("good")).await.unwrap();
    producer.publish(payload("bad")).await.unwrap();
    assert!(channel.published.lock().unwrap().iter().all(|m| m.is_persistent()));

    let mut consumer = Consumer::new(template, reject_bad, "worker");
    assert!(consumer.connect().await);
    consumer.listen().await.unwrap();

    let timeout = Some(Duration::from_secs(1));
    assert_eq!(
        consumer.wait(timeout).await.unwrap(),
        WaitOutcome::Delivered(DeliveryOutcome::Success)
    );
    assert_eq!(
        consumer.wait(timeout).await.unwrap(),
        WaitOutcome::Delivered(DeliveryOutcome::Failure)
    );

    assert_eq!(*channel.acks.lock().unwrap(), vec![1]);
    assert_eq!(*channel.nacks.lock().unwrap(), vec![(2, true)]);

    let declared = channel.declared.lock().unwrap();
    assert!(declared.iter().all(|(name, options)| {
        name == "orders" && options.durable && !options.auto_delete
    }));
    assert!(channel.qos.lock().unwrap().iter().all(|qos| qos.global && qos.prefetch_count == 1));
    assert!(!channel.subscriptions.lock().unwrap()[0].no_ack);
    assert_eq!(connection.reconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_basic_consumer_never_settles_messages() {
    let channel = InMemoryChannel::new();
    let connection = FakeConnection::new(channel.clone());
    let template = template(connection, QueueStrategy::Basic);

    let producer = Producer::new(template.clone());
    producer.publish(payload("good")).await.unwrap();
    producer.publish(payload("bad")).await.unwrap();

    let mut consumer = Consumer::new(template, reject_bad, "worker");
    assert!(consumer.connect().await);
    consumer.listen().await.unwrap();
    consumer.wait(None).await.unwrap();
    consumer.wait(None).await.unwrap();

    assert!(channel.acks.lock().unwrap().is_empty());
    assert!(channel.nacks.lock().unwrap().is_empty());

    let subscription = channel.subscriptions.lock().unwrap()[0].clone();
    assert!(subscription.no_ack);
    let options = channel.declared.lock().unwrap()[0].1;
    assert!(!options.durable && options.auto_delete);
}

#[tokio::test]
async fn test_wait_times_out_on_empty_queue() {
    let channel = InMemoryChannel::new();
    let template = template(FakeConnection::new(channel.clone()), QueueStrategy::Basic);

    let mut consumer = Consumer::new(template, reject_bad, "worker");
    assert!(consumer.connect().await);
    consumer.listen().await.unwrap();

    let outcome = consumer.wait(Some(Duration::from_millis(20))).await.unwrap();
    assert_eq!(outcome, WaitOutcome::TimedOut);
    assert!(consumer.is_busy().await);

    consumer.cancel().await.unwrap();
    assert_eq!(consumer.wait(None).await.unwrap(), WaitOutcome::Closed);
}

#[tokio::test]
async fn test_encrypted_messages_round_trip_between_templates() {
    let channel = InMemoryChannel::new();
    let connection = FakeConnection::new(channel.clone());
    let encrypted = |secret: &str| {
        Arc::new(
            QueueTemplate::new(connection.clone(), QueueStrategy::FaultTolerant, "orders")
                .with_encryption(Box::new(Aes256GcmEncryption::new(secret).unwrap())),
        )
    };

    let producer = Producer::new(encrypted("s3cr3t"));
    producer.publish(payload("top secret")).await.unwrap();
    producer.publish(payload("top secret")).await.unwrap();

    let body = channel.published.lock().unwrap()[0].body.clone();
    assert!(!String::from_utf8_lossy(&body).contains("top secret"));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = seen.clone();
    let handler = move |message: &ReceivedMessage| -> anyhow::Result<bool> {
        recorded
            .lock()
            .unwrap()
            .push(message.get_str("message").unwrap_or_default().to_string());
        Ok(true)
    };

    let mut consumer = Consumer::new(encrypted("s3cr3t"), handler, "reader");
    consumer.listen().await.unwrap();
    consumer.wait(None).await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["top secret"]);

    let mut wrong_key = Consumer::new(encrypted("other"), reject_bad, "intruder");
    wrong_key.listen().await.unwrap();
    let err = wrong_key.wait(None).await.unwrap_err();
    assert!(matches!(err, RabbitMQError::DeserializationError(_)));
    assert!(channel.nacks.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_consumer_command_stops_from_handler_and_closes() {
    let channel = InMemoryChannel::new();
    let connection = FakeConnection::new(channel.clone());

    let events = Arc::new(Mutex::new(Vec::new()));
    let recorded = events.clone();
    let sink: Arc<dyn EventSink> = Arc::new(move |name: &str, event: &ConsumerEvent| {
        recorded
            .lock()
            .unwrap()
            .push(format!("{}:{}", name, event.message.delivery_tag));
    });
    let template = Arc::new(
        QueueTemplate::new(connection.clone(), QueueStrategy::FaultTolerant, "orders")
            .with_event_sink(sink),
    );

    let producer = Producer::new(template.clone());
    for text in ["one", "two", "three"] {
        producer.publish(payload(text)).await.unwrap();
    }

    let stop = StopHandle::default();
    let stopper = stop.clone();
    let handler = move |message: &ReceivedMessage| -> anyhow::Result<bool> {
        if message.get_str("message") == Some("two") {
            stopper.stop();
        }
        Ok(true)
    };

    let consumer = Consumer::new(template, handler, "worker");
    let options = RunOptions {
        interval: Duration::ZERO,
        wait_timeout: Some(Duration::from_millis(100)),
        debug: false,
    };
    let mut command = ConsumerCommand::new(consumer, options).with_stop_handle(stop);

    assert_eq!(command.execute().await, ExitStatus::Success);
    assert_eq!(*channel.acks.lock().unwrap(), vec![1, 2]);
    assert_eq!(channel.ready_count(), 1);
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "receive:1",
            "consumer.success:1",
            "receive:2",
            "consumer.success:2"
        ]
    );
    assert!(channel.closed.load(Ordering::SeqCst));
    assert_eq!(connection.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_consumer_command_fails_when_broker_is_unreachable() {
    let channel = InMemoryChannel::new();
    let connection = FakeConnection::unreachable(channel.clone());
    let consumer = Consumer::new(
        template(connection.clone(), QueueStrategy::FaultTolerant),
        reject_bad,
        "worker",
    );

    let mut command = ConsumerCommand::new(consumer, RunOptions::default());
    assert_eq!(command.execute().await, ExitStatus::Failure);

    assert!(channel.declared.lock().unwrap().is_empty());
    assert!(channel.subscriptions.lock().unwrap().is_empty());
    assert_eq!(connection.reconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_redeclaring_with_another_strategy_is_a_topology_error() {
    let channel = InMemoryChannel::new();
    let connection = FakeConnection::new(channel.clone());

    template(connection.clone(), QueueStrategy::FaultTolerant)
        .declare_queue()
        .await
        .unwrap();

    let basic = template(connection, QueueStrategy::Basic);
    let err = basic.declare_queue().await.unwrap_err();
    assert!(matches!(err, RabbitMQError::TopologyError { ref queue, .. } if queue == "orders"));
    assert!(!basic.is_declared());
}

#[tokio::test]
async fn test_cancelled_consumer_does_not_take_deliveries_of_its_sibling() {
    let channel = InMemoryChannel::new();
    let template = template(FakeConnection::new(channel.clone()), QueueStrategy::Basic);

    let producer = Producer::new(template.clone());
    producer.publish(payload("only one")).await.unwrap();

    let mut first = Consumer::new(template.clone(), reject_bad, "first");
    let mut second = Consumer::new(template, reject_bad, "second");
    first.listen().await.unwrap();
    second.listen().await.unwrap();

    first.cancel().await.unwrap();
    assert_eq!(first.wait(None).await.unwrap(), WaitOutcome::Closed);
    assert_eq!(channel.ready_count(), 1);

    assert_eq!(
        second.wait(Some(Duration::from_secs(1))).await.unwrap(),
        WaitOutcome::Delivered(DeliveryOutcome::Success)
    );
    assert_eq!(channel.ready_count(), 0);
}
