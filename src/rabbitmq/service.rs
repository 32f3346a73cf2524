// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Broker Queue Service
//!
//! Provisions a channel per declaration, publishes persistent messages and
//! runs one receive loop per consumer channel. A loop works on as many
//! deliveries at once as the channel's prefetch allows. Messages on channels
//! that are not auto-commit are acknowledged exactly once, when their retry
//! loop ends, whether or not a handler ever succeeded.

use super::{
    client::{
        AmqpChannel, AmqpConnector, DeliveryStream, InboundDelivery, RabbitMQChannelOptions,
        RabbitMQClient,
    },
    topology::Topology,
};
use crate::{
    channel::ChannelDirection,
    config::{ConsumeDeclaration, QueueConfig, TransportKind},
    consumer::{consume, ConsumerDefinition},
    errors::QueueError,
    handler::{ConsumerHandler, Subscriptions},
    message::{Envelope, PublishOptions},
    otel::{self, TRACER_NAME},
    queue::QueueDefinition,
    service::QueueService,
};
use async_trait::async_trait;
use futures_util::{future::join_all, StreamExt};
use opentelemetry::{
    global,
    trace::{Status, TraceContextExt},
};
use serde_json::Value;
use std::{borrow::Cow, sync::Arc};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info};

const SYSTEM: &str = "rabbitmq";

pub struct RabbitMQService {
    config: QueueConfig,
    client: RabbitMQClient,
    subscriptions: Subscriptions,
    shutdown: watch::Sender<bool>,
    receivers: Mutex<Vec<JoinHandle<()>>>,
    started: bool,
}

impl RabbitMQService {
    pub fn new(config: QueueConfig, connector: Arc<dyn AmqpConnector>) -> Self {
        let client = RabbitMQClient::new(config.connect.clone(), connector);
        let (shutdown, _) = watch::channel(false);

        RabbitMQService {
            config,
            client,
            subscriptions: Subscriptions::new(),
            shutdown,
            receivers: Mutex::new(vec![]),
            started: false,
        }
    }

    fn consumer_topology(&self, decl: &ConsumeDeclaration) -> Topology {
        decl.routing_keys.iter().fold(
            Topology::exchange(
                &decl.exchange_name,
                decl.exchange_type.clone(),
                self.config.enable_delayed_message,
            )
            .queue(QueueDefinition::new(&decl.queue_name).queue_type(decl.queue_type.clone()))
            .prefetch(decl.prefetch),
            |topology, routing_key| topology.bind(routing_key),
        )
    }

    async fn provision_consumer(
        &mut self,
        decl: &ConsumeDeclaration,
    ) -> Result<(Arc<dyn AmqpChannel>, DeliveryStream), QueueError> {
        let options = RabbitMQChannelOptions {
            name: decl.name.clone(),
            direction: ChannelDirection::Consumer,
            topology: self.consumer_topology(decl),
        };

        let channel = self.client.add_channel(&options).await?;
        let deliveries = channel
            .consume(&decl.queue_name, &decl.name, decl.auto_commit)
            .await?;

        Ok((channel, deliveries))
    }

    /// Runs up to `prefetch` deliveries at once; zero leaves it unbounded,
    /// as the broker does.
    fn spawn_receive_loop(
        &self,
        channel: Arc<dyn AmqpChannel>,
        deliveries: DeliveryStream,
        def: ConsumerDefinition,
        prefetch: u16,
    ) -> JoinHandle<()> {
        let mut shutdown = self.shutdown.subscribe();
        let limit = (prefetch > 0).then_some(usize::from(prefetch));

        tokio::spawn(async move {
            info!(channel = def.name, queue = def.destination, "amqp subscribe ready");

            let stopped = async move {
                let _ = shutdown.changed().await;
            };

            deliveries
                .take_until(stopped)
                .for_each_concurrent(limit, |next| {
                    let channel = &channel;
                    let def = &def;
                    async move {
                        match next {
                            Ok(delivery) => handle_delivery(channel.as_ref(), def, delivery).await,
                            Err(err) => error!(
                                error = err.to_string(),
                                channel = def.name,
                                "errors consume msg"
                            ),
                        }
                    }
                })
                .await;

            debug!(channel = def.name, "receive loop stopped");
        })
    }
}

async fn handle_delivery(
    channel: &dyn AmqpChannel,
    def: &ConsumerDefinition,
    delivery: InboundDelivery,
) {
    if let Err(err) = consume(def, &delivery.envelope.payload, &delivery.envelope.headers).await {
        error!(error = err.to_string(), channel = def.name, "error consume msg");
    }

    if !def.auto_commit {
        if let Err(err) = channel.ack(delivery.delivery_tag).await {
            error!(
                error = err.to_string(),
                channel = def.name,
                delivery_tag = delivery.delivery_tag,
                "error whiling ack msg"
            );
        }
    }
}

#[async_trait]
impl QueueService for RabbitMQService {
    fn transport(&self) -> TransportKind {
        TransportKind::RabbitMQ
    }

    async fn subscribe(&self, channel: &str, handler: Arc<dyn ConsumerHandler>) {
        self.subscriptions.register(channel, handler).await;
    }

    async fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        info!("rabbitmq service starting");
        if !self.client.connect().await {
            return;
        }

        for decl in self.config.consume.clone() {
            match self.provision_consumer(&decl).await {
                Ok((channel, deliveries)) => {
                    let def = ConsumerDefinition {
                        name: decl.name.clone(),
                        destination: decl.queue_name.clone(),
                        system: SYSTEM,
                        auto_commit: decl.auto_commit,
                        policy: self.config.delivery,
                        subscriptions: self.subscriptions.clone(),
                    };
                    let handle = self.spawn_receive_loop(channel, deliveries, def, decl.prefetch);
                    self.receivers.lock().await.push(handle);
                }
                Err(err) => error!(
                    error = err.to_string(),
                    channel = decl.name,
                    "failure to provision consumer"
                ),
            }
        }

        for decl in self.config.publish.clone() {
            let options = RabbitMQChannelOptions {
                name: decl.name.clone(),
                direction: ChannelDirection::Producer,
                topology: Topology::exchange(
                    &decl.exchange_name,
                    decl.exchange_type.clone(),
                    self.config.enable_delayed_message,
                ),
            };

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

        let exchange_name = &self
            .config
            .publish_declaration(&options.name)
            .ok_or_else(|| QueueError::ChannelNotFound(options.name.clone()))?
            .exchange_name;
        let routing_key = options.routing_key.as_deref().unwrap_or_default();

        let mut envelope = Envelope::json(message)?;
        envelope.headers = options.merged_headers();

        let tracer = global::tracer(TRACER_NAME);
        let cx = otel::start_producer_span(&tracer, SYSTEM, exchange_name, &mut envelope.headers);

        debug!(channel = options.name, exchange = exchange_name, routing_key, "publish message");
        let result = entry.handle.publish(exchange_name, routing_key, &envelope).await;

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
        info!("rabbitmq service shutdown");
        let _ = self.shutdown.send(true);
        self.client.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{DeliveryPolicy, PublishDeclaration},
        consumer::tests::flaky_handler,
        exchange::ExchangeKind,
        handler::MockConsumerHandler,
        rabbitmq::client::{tests::connector_with, MockAmqpChannel},
    };
    use futures_util::stream;
    use mockall::predicate::eq;
    use serde_json::json;
    use std::{sync::Mutex as StdMutex, time::Duration};
    use tokio::time::Instant;

    const CHANNEL: &str = "subscribe.transaction.send";

    fn consume_config(auto_commit: bool) -> QueueConfig {
        QueueConfig {
            transport: TransportKind::RabbitMQ,
            consume: vec![ConsumeDeclaration {
                name: CHANNEL.to_owned(),
                exchange_name: "transaction.send".to_owned(),
                exchange_type: ExchangeKind::Direct,
                queue_name: "transaction.send.queue".to_owned(),
                prefetch: 5,
                routing_keys: vec!["created".to_owned(), "updated".to_owned()],
                auto_commit,
                ..ConsumeDeclaration::default()
            }],
            publish: vec![],
            ..QueueConfig::default()
        }
    }

    fn publish_config() -> QueueConfig {
        QueueConfig {
            transport: TransportKind::RabbitMQ,
            consume: vec![],
            publish: vec![PublishDeclaration {
                name: "publish.transaction.send".to_owned(),
                exchange_name: "transaction.send".to_owned(),
                exchange_type: ExchangeKind::XMessageDelayed,
            }],
            enable_delayed_message: true,
            ..QueueConfig::default()
        }
    }

    fn delivery(tag: u64, payload: &[u8]) -> InboundDelivery {
        InboundDelivery {
            delivery_tag: tag,
            envelope: Envelope {
                payload: payload.to_vec(),
                ..Envelope::default()
            },
        }
    }

    fn consumer_channel(
        deliveries: Vec<InboundDelivery>,
        no_ack: bool,
        acks: usize,
    ) -> MockAmqpChannel {
        prefetched_channel(5, deliveries, no_ack, acks)
    }

    /// Consumer channel accepting provisioning and yielding `deliveries`.
    fn prefetched_channel(
        prefetch: u16,
        deliveries: Vec<InboundDelivery>,
        no_ack: bool,
        acks: usize,
    ) -> MockAmqpChannel {
        let mut channel = MockAmqpChannel::new();
        channel.expect_declare_exchange().returning(|_, _, _| Ok(()));
        channel.expect_declare_queue().returning(|_| Ok(()));
        channel
            .expect_set_prefetch()
            .with(eq(prefetch))
            .returning(|_| Ok(()));
        channel.expect_bind_queue().times(2).returning(|_, _, _| Ok(()));

        let deliveries = StdMutex::new(Some(deliveries));
        channel
            .expect_consume()
            .with(eq("transaction.send.queue"), eq(CHANNEL), eq(no_ack))
            .times(1)
            .returning(move |_, _, _| {
                let items = deliveries.lock().unwrap().take().unwrap_or_default();
                Ok(stream::iter(items.into_iter().map(Ok)).boxed())
            });
        channel.expect_ack().times(acks).returning(|_| Ok(()));
        channel
    }

    #[tokio::test]
    async fn should_ack_each_handled_delivery() {
        let payload = serde_json::to_vec(&json!({"id": "cat-1"})).unwrap();
        let channel = consumer_channel(
            vec![delivery(1, &payload), delivery(2, &payload)],
            false,
            2,
        );
        let (handler, seen) = flaky_handler(0, 2);

        let mut service = RabbitMQService::new(consume_config(false), connector_with(vec![channel]));
        service.subscribe(CHANNEL, Arc::new(handler)).await;
        service.start().await;
        service.consume_blocking().await;

        assert_eq!(*seen.lock().unwrap(), vec![0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn should_retry_then_ack_once() {
        let payload = serde_json::to_vec(&json!({"id": "cat-1"})).unwrap();
        let channel = consumer_channel(vec![delivery(7, &payload)], false, 1);
        let (handler, seen) = flaky_handler(2, 3);

        let mut config = consume_config(false);
        config.delivery = DeliveryPolicy::new(3, 100).unwrap();

        let mut service = RabbitMQService::new(config, connector_with(vec![channel]));
        service.subscribe(CHANNEL, Arc::new(handler)).await;

        let started = Instant::now();
        service.start().await;
        service.consume_blocking().await;

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    /// Fails every attempt for id "a", succeeds for anything else. Records
    /// each call's id and the time it started.
    fn timed_handler(
        started: Instant,
        times: usize,
    ) -> (MockConsumerHandler, Arc<StdMutex<Vec<(String, Duration)>>>) {
        let calls = Arc::new(StdMutex::new(vec![]));
        let recorded = calls.clone();

        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .times(times)
            .returning(move |_, msg, _, _| {
                let id = msg["id"].as_str().unwrap_or_default().to_owned();
                recorded
                    .lock()
                    .unwrap()
                    .push((id.clone(), started.elapsed()));
                if id == "a" {
                    Err(QueueError::HandlerError("down".to_owned()))
                } else {
                    Ok(())
                }
            });

        (handler, calls)
    }

    fn first_call(calls: &[(String, Duration)], id: &str) -> Duration {
        calls.iter().find(|(seen, _)| seen == id).unwrap().1
    }

    fn two_deliveries() -> Vec<InboundDelivery> {
        vec![
            delivery(1, &serde_json::to_vec(&json!({"id": "a"})).unwrap()),
            delivery(2, &serde_json::to_vec(&json!({"id": "b"})).unwrap()),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn should_ack_once_after_exhausting_attempts() {
        let payload = serde_json::to_vec(&json!({"id": "cat-1"})).unwrap();
        let channel = consumer_channel(vec![delivery(9, &payload)], false, 1);
        let (handler, seen) = flaky_handler(u32::MAX, 3);

        let mut config = consume_config(false);
        config.delivery = DeliveryPolicy::new(3, 100).unwrap();

        let mut service = RabbitMQService::new(config, connector_with(vec![channel]));
        service.subscribe(CHANNEL, Arc::new(handler)).await;

        let started = Instant::now();
        service.start().await;
        service.consume_blocking().await;

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn should_not_hold_later_deliveries_behind_a_retrying_one() {
        let channel = consumer_channel(two_deliveries(), false, 2);
        let started = Instant::now();
        let (handler, calls) = timed_handler(started, 4);

        let mut config = consume_config(false);
        config.delivery = DeliveryPolicy::new(3, 100).unwrap();

        let mut service = RabbitMQService::new(config, connector_with(vec![channel]));
        service.subscribe(CHANNEL, Arc::new(handler)).await;
        service.start().await;
        service.consume_blocking().await;

        let calls = calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|(id, _)| id == "a").count(), 3);
        assert!(first_call(&calls, "b") < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn should_work_one_delivery_at_a_time_with_prefetch_of_one() {
        let channel = prefetched_channel(1, two_deliveries(), false, 2);
        let started = Instant::now();
        let (handler, calls) = timed_handler(started, 4);

        let mut config = consume_config(false);
        config.consume[0].prefetch = 1;
        config.delivery = DeliveryPolicy::new(3, 100).unwrap();

        let mut service = RabbitMQService::new(config, connector_with(vec![channel]));
        service.subscribe(CHANNEL, Arc::new(handler)).await;
        service.start().await;
        service.consume_blocking().await;

        let calls = calls.lock().unwrap();
        assert!(first_call(&calls, "b") >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn should_not_ack_on_auto_commit_channel() {
        let payload = serde_json::to_vec(&json!({"id": "cat-1"})).unwrap();
        let channel = consumer_channel(vec![delivery(1, &payload)], true, 0);
        let (handler, seen) = flaky_handler(u32::MAX, 1);

        let mut service = RabbitMQService::new(consume_config(true), connector_with(vec![channel]));
        service.subscribe(CHANNEL, Arc::new(handler)).await;
        service.start().await;
        service.consume_blocking().await;

        assert_eq!(*seen.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn should_ack_undeserializable_payload() {
        let channel = consumer_channel(vec![delivery(3, b"not json")], false, 1);
        let (handler, _) = flaky_handler(0, 0);

        let mut service = RabbitMQService::new(consume_config(false), connector_with(vec![channel]));
        service.subscribe(CHANNEL, Arc::new(handler)).await;
        service.start().await;
        service.consume_blocking().await;
    }

    #[tokio::test]
    async fn should_publish_persistent_message_with_delay_header() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_exchange()
            .times(1)
            .withf(|name, kind, args| {
                name == "transaction.send"
                    && *kind == ExchangeKind::XMessageDelayed
                    && args.contains_key("x-delayed-type")
            })
            .returning(|_, _, _| Ok(()));
        channel
            .expect_publish()
            .times(1)
            .withf(|exchange, routing_key, envelope| {
                let value: Value = serde_json::from_slice(&envelope.payload).unwrap();
                exchange == "transaction.send"
                    && routing_key == "created"
                    && value == json!({"id": "cat-1"})
                    && envelope.headers.get("x-delay").map(String::as_str) == Some("500")
                    && envelope.headers.get("tenant").map(String::as_str) == Some("acme")
            })
            .returning(|_, _, _| Ok(()));

        let mut service = RabbitMQService::new(publish_config(), connector_with(vec![channel]));
        service.start().await;

        let result = service
            .publish(
                &json!({"id": "cat-1"}),
                &PublishOptions::new("publish.transaction.send")
                    .routing_key("created")
                    .delay(500)
                    .header("tenant", "acme"),
            )
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn should_fail_publish_on_unprovisioned_channel() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_exchange()
            .returning(|name, _, _| Err(QueueError::DeclareExchangeError(name.to_owned())));
        channel.expect_close().returning(|| Ok(()));

        let mut service = RabbitMQService::new(publish_config(), connector_with(vec![channel]));
        service.start().await;

        let result = service
            .publish(&json!({}), &PublishOptions::new("publish.transaction.send"))
            .await;

        assert_eq!(
            result,
            Err(QueueError::ChannelNotFound(
                "publish.transaction.send".to_owned()
            ))
        );
    }

    #[tokio::test]
    async fn should_close_channels_on_shutdown() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_declare_exchange().returning(|_, _, _| Ok(()));
        channel.expect_close().times(1).returning(|| Ok(()));

        let mut service = RabbitMQService::new(publish_config(), connector_with(vec![channel]));
        service.start().await;
        service.shutdown().await;
    }
}
