// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Log Broker Client
//!
//! `KafkaClient` owns the broker connection and the registry of producer and
//! consumer channels. The SDK itself sits behind the `LogConnector`,
//! `LogBroker`, `LogProducer` and `LogConsumer` traits; `broker.rs` provides
//! the `rdkafka` implementations.

use crate::{
    channel::{ChannelDirection, ChannelEntry, ChannelRegistry},
    config::ConnectOptions,
    errors::QueueError,
    message::Envelope,
};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::sync::Arc;
use tracing::{debug, error, info};

#[cfg(test)]
use mockall::automock;

/// A record received from a topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub envelope: Envelope,
}

/// Send-capable channel bound to a topic family.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LogProducer: Send + Sync {
    /// Verifies the brokers are reachable.
    async fn connect(&self) -> Result<(), QueueError>;

    async fn send(&self, topic: &str, envelope: &Envelope) -> Result<(), QueueError>;

    /// Flushes pending records and releases the producer.
    async fn disconnect(&self) -> Result<(), QueueError>;
}

/// Receive-capable channel, one consumer group member.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LogConsumer: Send + Sync {
    async fn connect(&self) -> Result<(), QueueError>;

    /// Subscribes from the current log position.
    async fn subscribe(&self, topic: &str) -> Result<(), QueueError>;

    /// Waits for the next record; `None` once the consumer is closed.
    async fn recv(&self) -> Result<Option<InboundRecord>, QueueError>;

    /// Marks the record at `offset` as finished; the next auto-commit moves
    /// the group past it.
    async fn store_offset(&self, topic: &str, partition: i32, offset: i64)
        -> Result<(), QueueError>;

    async fn disconnect(&self) -> Result<(), QueueError>;
}

/// An established connection able to create producers and consumers.
#[cfg_attr(test, automock)]
pub trait LogBroker: Send + Sync {
    fn producer(&self) -> Result<Arc<dyn LogProducer>, QueueError>;

    fn consumer(&self, group_id: &str) -> Result<Arc<dyn LogConsumer>, QueueError>;
}

/// Establishes the broker connection from the connect options.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LogConnector: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn LogBroker>, QueueError>;
}

/// Live handle stored in the registry.
#[derive(Clone)]
pub enum KafkaChannel {
    Producer(Arc<dyn LogProducer>),
    Consumer(Arc<dyn LogConsumer>),
}

/// Options for opening one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaChannelOptions {
    pub name: String,
    /// Exchange name for producers, full topic for consumers.
    pub destination: String,
    pub direction: ChannelDirection,
    pub group_id: String,
}

impl KafkaChannelOptions {
    pub fn producer(name: &str, exchange_name: &str) -> Self {
        KafkaChannelOptions {
            name: name.to_owned(),
            destination: exchange_name.to_owned(),
            direction: ChannelDirection::Producer,
            group_id: String::new(),
        }
    }

    pub fn consumer(name: &str, topic: &str, group_id: &str) -> Self {
        KafkaChannelOptions {
            name: name.to_owned(),
            destination: topic.to_owned(),
            direction: ChannelDirection::Consumer,
            group_id: group_id.to_owned(),
        }
    }
}

/// Derives the topic a logical exchange maps to for a routing key.
pub fn topic_name(exchange_name: &str, routing_key: Option<&str>) -> String {
    match routing_key {
        Some(key) if !key.is_empty() => format!("{}_{}", exchange_name, key),
        _ => exchange_name.to_owned(),
    }
}

pub struct KafkaClient {
    options: ConnectOptions,
    connector: Arc<dyn LogConnector>,
    broker: Option<Arc<dyn LogBroker>>,
    channels: ChannelRegistry<KafkaChannel>,
}

impl KafkaClient {
    pub fn new(options: ConnectOptions, connector: Arc<dyn LogConnector>) -> Self {
        KafkaClient {
            options,
            connector,
            broker: None,
            channels: ChannelRegistry::new(),
        }
    }

    /// Establishes the broker connection once.
    ///
    /// A failure is logged and leaves the client disconnected; channels
    /// requested afterwards fail with `NotConnected`.
    pub async fn connect(&mut self) -> bool {
        if self.broker.is_some() {
            return true;
        }

        debug!(brokers = ?self.options.brokers, "creating kafka connection...");
        match self.connector.connect(&self.options).await {
            Ok(broker) => {
                info!("kafka connected");
                self.broker = Some(broker);
                true
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.broker.is_some()
    }

    /// Opens, connects and registers a channel. Consumers are also
    /// subscribed to their topic.
    ///
    /// The channel only enters the registry once fully provisioned, so a
    /// channel that failed along the way is reported as not found later on.
    pub async fn add_channel(
        &mut self,
        options: &KafkaChannelOptions,
    ) -> Result<KafkaChannel, QueueError> {
        let broker = self.broker.as_ref().ok_or(QueueError::NotConnected)?;

        debug!(
            channel = options.name,
            destination = options.destination,
            "creating channel..."
        );

        let channel = match options.direction {
            ChannelDirection::Producer => {
                let producer = broker.producer()?;
                producer.connect().await?;
                KafkaChannel::Producer(producer)
            }
            ChannelDirection::Consumer => {
                let consumer = broker.consumer(&options.group_id)?;
                consumer.connect().await?;
                consumer.subscribe(&options.destination).await?;
                KafkaChannel::Consumer(consumer)
            }
        };

        self.channels.insert(
            &options.name,
            &options.destination,
            options.direction,
            channel.clone(),
        );

        Ok(channel)
    }

    pub fn get_channel(
        &self,
        name: &str,
        direction: ChannelDirection,
    ) -> Option<&ChannelEntry<KafkaChannel>> {
        self.channels.get(name, direction)
    }

    /// Disconnects every registered channel; failures are logged only.
    pub async fn shutdown(&self) {
        debug!("kafka client shutdown");

        let closing = [ChannelDirection::Producer, ChannelDirection::Consumer]
            .into_iter()
            .flat_map(|direction| self.channels.iter(direction))
            .map(|(name, entry)| async move {
                let result = match &entry.handle {
                    KafkaChannel::Producer(producer) => producer.disconnect().await,
                    KafkaChannel::Consumer(consumer) => consumer.disconnect().await,
                };
                if let Err(err) = result {
                    error!(error = err.to_string(), channel = name, "failure to close channel");
                }
            });

        join_all(closing).await;
    }
}
