// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Log Broker Queue Service
//!
//! Provisions one consumer per (exchange, routing key) topic and one producer
//! per publish declaration, publishes records and runs a receive loop per
//! consumer. Offsets are committed by the client's auto-commit, so a message
//! counts as consumed once its retry loop ends, whatever the outcome.

use super::client::{
    topic_name, KafkaChannel, KafkaChannelOptions, KafkaClient, LogConnector, LogConsumer,
};
use crate::{
    channel::ChannelDirection,
    config::{ConsumeDeclaration, QueueConfig, TransportKind},
    consumer::{consume, ConsumerDefinition},
    errors::QueueError,
    handler::{ConsumerHandler, Subscriptions},
    message::{Envelope, PublishOptions, X_DELAY_HEADER},
    otel::{self, TRACER_NAME},
    service::QueueService,
};
use async_trait::async_trait;
use futures_util::future::join_all;
use opentelemetry::{
    global,
    trace::{Status, TraceContextExt},
};
use serde_json::Value;
use std::{borrow::Cow, sync::Arc, time::Duration};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info};

const SYSTEM: &str = "kafka";
const RECV_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct KafkaService {
    config: QueueConfig,
    client: KafkaClient,
    subscriptions: Subscriptions,
    shutdown: watch::Sender<bool>,
    receivers: Mutex<Vec<JoinHandle<()>>>,
    started: bool,
}

impl KafkaService {
    pub fn new(config: QueueConfig, connector: Arc<dyn LogConnector>) -> Self {
        let client = KafkaClient::new(config.connect.clone(), connector);
        let (shutdown, _) = watch::channel(false);

        KafkaService {
            config,
            client,
            subscriptions: Subscriptions::new(),
            shutdown,
            receivers: Mutex::new(vec![]),
            started: false,
        }
    }

    /// Registry name of the consumer reading `topic` for `channel`; one
    /// logical channel may read several topics.
    fn consumer_channel_name(channel: &str, topic: &str) -> String {
        format!("{}@{}", channel, topic)
    }

    async fn provision_consumer(
        &mut self,
        decl: &ConsumeDeclaration,
        topic: &str,
    ) -> Result<Arc<dyn LogConsumer>, QueueError> {
        let options = KafkaChannelOptions::consumer(
            &Self::consumer_channel_name(&decl.name, topic),
            topic,
            &decl.name,
        );

        match self.client.add_channel(&options).await? {
            KafkaChannel::Consumer(consumer) => Ok(consumer),
            KafkaChannel::Producer(_) => Err(QueueError::ChannelError(decl.name.clone())),
        }
    }

    fn spawn_receive_loop(
        &self,
        consumer: Arc<dyn LogConsumer>,
        def: ConsumerDefinition,
    ) -> JoinHandle<()> {
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            info!(channel = def.name, topic = def.destination, "kafka subscribe ready");

            loop {
                let received = tokio::select! {
                    _ = shutdown.changed() => break,
                    received = consumer.recv() => received,
                };

                match received {
                    Ok(Some(record)) => {
                        debug!(
                            channel = def.name,
                            partition = record.partition,
                            offset = record.offset,
                            "record received"
                        );
                        if let Err(err) =
                            consume(&def, &record.envelope.payload, &record.envelope.headers).await
                        {
                            error!(
                                error = err.to_string(),
                                channel = def.name,
                                offset = record.offset,
                                "error consume msg"
                            );
                        }

                        // finished either way; auto-commit may now move past it
                        if let Err(err) = consumer
                            .store_offset(&record.topic, record.partition, record.offset)
                            .await
                        {
                            error!(
                                error = err.to_string(),
                                channel = def.name,
                                offset = record.offset,
                                "error storing offset"
                            );
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        error!(error = err.to_string(), channel = def.name, "errors consume msg");
                        tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                    }
                }
            }

            debug!(channel = def.name, topic = def.destination, "receive loop stopped");
        })
    }
}

#[async_trait]
impl QueueService for KafkaService {
    fn transport(&self) -> TransportKind {
        TransportKind::Kafka
    }

    async fn subscribe(&self, channel: &str, handler: Arc<dyn ConsumerHandler>) {
        self.subscriptions.register(channel, handler).await;
    }

    async fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        info!("kafka service starting");
        if !self.client.connect().await {
            return;
        }

        for decl in self.config.consume.clone() {
            for routing_key in &decl.routing_keys {
                let topic = topic_name(&decl.exchange_name, Some(routing_key));

                match self.provision_consumer(&decl, &topic).await {
                    Ok(consumer) => {
                        let def = ConsumerDefinition {
                            name: decl.name.clone(),
                            destination: topic.clone(),
                            system: SYSTEM,
                            auto_commit: decl.auto_commit,
                            policy: self.config.delivery,
                            subscriptions: self.subscriptions.clone(),
                        };
                        let handle = self.spawn_receive_loop(consumer, def);
                        self.receivers.lock().await.push(handle);
                    }
                    Err(err) => error!(
                        error = err.to_string(),
                        channel = decl.name,
                        topic,
                        "failure to provision consumer"
                    ),
                }
            }
        }

        for decl in self.config.publish.clone() {
            let options = KafkaChannelOptions::producer(&decl.name, &decl.exchange_name);
            if let Err(err) = self.client.add_channel(&options).await {
                error!(
                    error = err.to_string(),
                    channel = decl.name,
                    "failure to provision producer"
                );
            }
        }
    }

    async fn publish(&self, message: &Value, options: &PublishOptions) -> Result<(), QueueError> {
        let entry = self
            .client
            .get_channel(&options.name, ChannelDirection::Producer)
            .ok_or_else(|| QueueError::ChannelNotFound(options.name.clone()))?;

        let KafkaChannel::Producer(producer) = &entry.handle else {
            return Err(QueueError::ChannelNotFound(options.name.clone()));
        };

        let topic = topic_name(&entry.destination, options.routing_key.as_deref());

        // Topics have no delayed delivery; the directive is honored here and
        // never reaches the record.
        let mut envelope = Envelope::json(message)?.with_key(options.key.clone());
        envelope.headers = options.merged_headers();
        let delay = envelope.delay();
        envelope.headers.remove(X_DELAY_HEADER);

        let tracer = global::tracer(TRACER_NAME);
        let cx = otel::start_producer_span(&tracer, SYSTEM, &topic, &mut envelope.headers);

        if let Some(ms) = delay {
            debug!(channel = options.name, delay = ms, "delayed message");
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        debug!(channel = options.name, topic, "publish message");
        let result = producer.send(&topic, &envelope).await;

        match &result {
            Ok(()) => cx.span().set_status(Status::Ok),
            Err(err) => {
                cx.span().record_error(err);
                cx.span().set_status(Status::Error {
                    description: Cow::from("error publishing message"),
                });
            }
        }
        cx.span().end();

        result
    }

    async fn consume_blocking(&self) {
        let handles: Vec<_> = self.receivers.lock().await.drain(..).collect();
        for res in join_all(handles).await {
            if let Err(err) = res {
                error!(error = err.to_string(), "receive loop panicked");
            }
        }
    }

    async fn shutdown(&self) {
        info!("kafka service shutdown");
        let _ = self.shutdown.send(true);
        self.client.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ConsumeDeclaration, DeliveryPolicy, PublishDeclaration},
        consumer::tests::flaky_handler,
        handler::MockConsumerHandler,
        kafka::client::{
            InboundRecord, LogBroker, MockLogBroker, MockLogConnector, MockLogConsumer,
            MockLogProducer,
        },
    };
    use mockall::{predicate::eq, Sequence};
    use serde_json::json;
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex as StdMutex},
    };
    use tokio::time::Instant;

    fn config() -> QueueConfig {
        QueueConfig {
            consume: vec![ConsumeDeclaration {
                name: "subscribe.transaction.send".to_owned(),
                exchange_name: "transaction.send".to_owned(),
                routing_keys: vec!["created".to_owned(), "updated".to_owned()],
                ..ConsumeDeclaration::default()
            }],
            publish: vec![PublishDeclaration {
                name: "transaction.send".to_owned(),
                exchange_name: "transaction.send".to_owned(),
                ..PublishDeclaration::default()
            }],
            ..QueueConfig::default()
        }
    }

    fn connector(broker: MockLogBroker) -> Arc<dyn LogConnector> {
        let broker: Arc<dyn LogBroker> = Arc::new(broker);
        let mut connector = MockLogConnector::new();
        connector
            .expect_connect()
            .returning(move |_| Ok(broker.clone()));
        Arc::new(connector)
    }

    fn idle_consumer(expected_topics: Arc<StdMutex<Vec<String>>>) -> MockLogConsumer {
        let mut consumer = MockLogConsumer::new();
        consumer.expect_connect().returning(|| Ok(()));
        consumer.expect_subscribe().times(1).returning(move |topic| {
            expected_topics.lock().unwrap().push(topic.to_owned());
            Ok(())
        });
        consumer.expect_recv().returning(|| Ok(None));
        consumer
    }

    fn producer_with(send: MockLogProducer) -> MockLogBroker {
        let send = Arc::new(StdMutex::new(Some(send)));
        let mut broker = MockLogBroker::new();
        broker.expect_producer().times(1).returning(move || {
            let producer = send.lock().unwrap().take().unwrap();
            Ok(Arc::new(producer))
        });
        broker
    }

    #[tokio::test]
    async fn should_provision_one_consumer_per_routing_key() {
        let topics = Arc::new(StdMutex::new(vec![]));

        let mut producer = MockLogProducer::new();
        producer.expect_connect().times(1).returning(|| Ok(()));
        let mut broker = producer_with(producer);

        let seen = topics.clone();
        broker
            .expect_consumer()
            .times(2)
            .returning(move |group| {
                assert_eq!(group, "subscribe.transaction.send");
                Ok(Arc::new(idle_consumer(seen.clone())))
            });

        let mut service = KafkaService::new(config(), connector(broker));
        service.start().await;
        service.consume_blocking().await;

        let mut topics = topics.lock().unwrap().clone();
        topics.sort();
        assert_eq!(
            topics,
            vec!["transaction.send_created", "transaction.send_updated"]
        );
        assert!(service
            .client
            .get_channel("transaction.send", ChannelDirection::Producer)
            .is_some());
    }

    #[tokio::test]
    async fn should_publish_keyed_record_to_derived_topic() {
        let mut producer = MockLogProducer::new();
        producer.expect_connect().returning(|| Ok(()));
        producer
            .expect_send()
            .times(1)
            .withf(|topic, envelope| {
                let value: Value = serde_json::from_slice(&envelope.payload).unwrap();
                topic == "transaction.send_created"
                    && value == json!({"id": "cat-1"})
                    && envelope.key.as_deref() == Some("cat-1")
                    && !envelope.headers.contains_key("x-delay")
            })
            .returning(|_, _| Ok(()));

        let mut service = KafkaService::new(
            QueueConfig {
                consume: vec![],
                ..config()
            },
            connector(producer_with(producer)),
        );
        service.start().await;

        let result = service
            .publish(
                &json!({"id": "cat-1"}),
                &PublishOptions::new("transaction.send")
                    .routing_key("created")
                    .key("cat-1"),
            )
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn should_wait_before_sending_delayed_message() {
        let mut producer = MockLogProducer::new();
        producer.expect_connect().returning(|| Ok(()));
        producer.expect_send().times(1).returning(|_, _| Ok(()));

        let mut service = KafkaService::new(
            QueueConfig {
                consume: vec![],
                ..config()
            },
            connector(producer_with(producer)),
        );
        service.start().await;

        let started = Instant::now();
        service
            .publish(
                &json!({"id": "cat-1"}),
                &PublishOptions::new("transaction.send")
                    .routing_key("created")
                    .delay(500),
            )
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn should_propagate_send_failures() {
        let mut producer = MockLogProducer::new();
        producer.expect_connect().returning(|| Ok(()));
        producer
            .expect_send()
            .times(1)
            .returning(|_, _| Err(QueueError::PublishingError("broker down".to_owned())));

        let mut service = KafkaService::new(
            QueueConfig {
                consume: vec![],
                ..config()
            },
            connector(producer_with(producer)),
        );
        service.start().await;

        let result = service
            .publish(&json!({}), &PublishOptions::new("transaction.send"))
            .await;

        assert_eq!(
            result,
            Err(QueueError::PublishingError("broker down".to_owned()))
        );
    }

    #[tokio::test]
    async fn should_fail_publish_on_unknown_channel() {
        let mut connector = MockLogConnector::new();
        connector
            .expect_connect()
            .returning(|_| Err(QueueError::ConnectionError));

        let mut service = KafkaService::new(config(), Arc::new(connector));
        service.start().await;

        let result = service
            .publish(&json!({"id": "cat-1"}), &PublishOptions::new("nope"))
            .await;

        assert_eq!(result, Err(QueueError::ChannelNotFound("nope".to_owned())));
    }

    fn record(offset: i64) -> InboundRecord {
        InboundRecord {
            topic: "transaction.send_created".to_owned(),
            partition: 3,
            offset,
            envelope: Envelope::json(&json!({"id": "cat-1"})).unwrap(),
        }
    }

    /// Consumer yielding `records` once, then reporting the stream closed.
    fn replaying_consumer(records: Vec<InboundRecord>) -> MockLogConsumer {
        let records = StdMutex::new(VecDeque::from(records));
        let mut consumer = MockLogConsumer::new();
        consumer.expect_connect().returning(|| Ok(()));
        consumer.expect_subscribe().returning(|_| Ok(()));
        consumer
            .expect_recv()
            .returning(move || Ok(records.lock().unwrap().pop_front()));
        consumer
    }

    fn broker_with_consumer(consumer: MockLogConsumer) -> MockLogBroker {
        let mut producer = MockLogProducer::new();
        producer.expect_connect().returning(|| Ok(()));
        let mut broker = producer_with(producer);

        let consumer = StdMutex::new(Some(consumer));
        broker.expect_consumer().times(1).returning(move |_| {
            let consumer = consumer.lock().unwrap().take().unwrap();
            Ok(Arc::new(consumer))
        });
        broker
    }

    fn single_topic_config() -> QueueConfig {
        let mut cfg = config();
        cfg.consume[0].routing_keys = vec!["created".to_owned()];
        cfg
    }

    #[tokio::test]
    async fn should_store_offset_after_handlers_run() {
        let mut seq = Sequence::new();

        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, msg, attempt, _| msg == &json!({"id": "cat-1"}) && *attempt == 0)
            .returning(|_, _, _, _| Ok(()));

        let mut consumer = replaying_consumer(vec![record(42)]);
        consumer
            .expect_store_offset()
            .with(eq("transaction.send_created"), eq(3), eq(42))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let mut service =
            KafkaService::new(single_topic_config(), connector(broker_with_consumer(consumer)));
        service
            .subscribe("subscribe.transaction.send", Arc::new(handler))
            .await;
        service.start().await;
        service.consume_blocking().await;
    }

    #[tokio::test(start_paused = true)]
    async fn should_store_offset_only_once_attempts_are_exhausted() {
        let started = Instant::now();
        let stored_at = Arc::new(StdMutex::new(vec![]));

        let (handler, seen) = flaky_handler(u32::MAX, 3);

        let mut consumer = replaying_consumer(vec![record(7)]);
        let recorded = stored_at.clone();
        consumer
            .expect_store_offset()
            .with(eq("transaction.send_created"), eq(3), eq(7))
            .times(1)
            .returning(move |_, _, _| {
                recorded.lock().unwrap().push(started.elapsed());
                Ok(())
            });

        let mut cfg = single_topic_config();
        cfg.delivery = DeliveryPolicy::new(3, 100).unwrap();

        let mut service = KafkaService::new(cfg, connector(broker_with_consumer(consumer)));
        service
            .subscribe("subscribe.transaction.send", Arc::new(handler))
            .await;
        service.start().await;
        service.consume_blocking().await;

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        let stored_at = stored_at.lock().unwrap();
        assert_eq!(stored_at.len(), 1);
        assert!(stored_at[0] >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn should_store_offset_of_undeserializable_record() {
        let mut garbage = record(9);
        garbage.envelope.payload = b"not json".to_vec();

        let mut consumer = replaying_consumer(vec![garbage]);
        consumer
            .expect_store_offset()
            .with(eq("transaction.send_created"), eq(3), eq(9))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let (handler, _) = flaky_handler(0, 0);

        let mut service =
            KafkaService::new(single_topic_config(), connector(broker_with_consumer(consumer)));
        service
            .subscribe("subscribe.transaction.send", Arc::new(handler))
            .await;
        service.start().await;
        service.consume_blocking().await;
    }
}
