// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Broker Client
//!
//! `RabbitMQClient` owns the AMQP connection and the registry of channels.
//! Each channel is provisioned with its topology before it is registered, so
//! a channel whose exchange or queue could not be asserted never shows up in
//! the registry. The SDK sits behind the `AmqpConnector`, `AmqpConnection`
//! and `AmqpChannel` traits; `amqp.rs` provides the `lapin` implementations.

use super::topology::Topology;
use crate::{
    channel::{ChannelDirection, ChannelEntry, ChannelRegistry},
    config::ConnectOptions,
    errors::QueueError,
    exchange::{Arguments, ExchangeKind},
    message::Envelope,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::{future::join_all, stream::BoxStream};
use std::sync::Arc;
use tracing::{debug, error, info};

#[cfg(test)]
use mockall::automock;

/// A message received from a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub envelope: Envelope,
}

pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, QueueError>>;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Asserts a durable exchange.
    async fn declare_exchange(
        &self,
        name: &str,
        kind: &ExchangeKind,
        arguments: &Arguments,
    ) -> Result<(), QueueError>;

    /// Asserts a durable queue.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), QueueError>;

    async fn set_prefetch(&self, count: u16) -> Result<(), QueueError>;

    async fn bind_queue(
        &self,
        queue_name: &str,
        exchange_name: &str,
        routing_key: &str,
    ) -> Result<(), QueueError>;

    /// Publishes a persistent message.
    async fn publish(
        &self,
        exchange_name: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), QueueError>;

    /// Starts consuming `queue_name`; with `no_ack` the broker drops each
    /// message as soon as it is delivered.
    async fn consume(
        &self,
        queue_name: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, QueueError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), QueueError>;

    async fn close(&self) -> Result<(), QueueError>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, QueueError>;

    async fn close(&self) -> Result<(), QueueError>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpConnector: Send + Sync {
    async fn connect(&self, options: &ConnectOptions)
        -> Result<Arc<dyn AmqpConnection>, QueueError>;
}

/// Options for opening one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RabbitMQChannelOptions {
    pub name: String,
    pub direction: ChannelDirection,
    pub topology: Topology,
}

pub struct RabbitMQClient {
    options: ConnectOptions,
    connector: Arc<dyn AmqpConnector>,
    connection: Option<Arc<dyn AmqpConnection>>,
    channels: ChannelRegistry<Arc<dyn AmqpChannel>>,
}

impl RabbitMQClient {
    pub fn new(options: ConnectOptions, connector: Arc<dyn AmqpConnector>) -> Self {
        RabbitMQClient {
            options,
            connector,
            connection: None,
            channels: ChannelRegistry::new(),
        }
    }

    /// Establishes the connection once. A failure is logged only.
    pub async fn connect(&mut self) -> bool {
        if self.connection.is_some() {
            return true;
        }

        debug!(host = self.options.host, "creating amqp connection...");
        match self.connector.connect(&self.options).await {
            Ok(connection) => {
                info!("amqp connected");
                self.connection = Some(connection);
                true
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Opens a channel, installs its topology and registers it.
    pub async fn add_channel(
        &mut self,
        options: &RabbitMQChannelOptions,
    ) -> Result<Arc<dyn AmqpChannel>, QueueError> {
        let connection = self.connection.as_ref().ok_or(QueueError::NotConnected)?;

        debug!(channel = options.name, "creating amqp channel...");
        let channel = connection.create_channel().await?;

        if let Err(err) = options.topology.install(channel.as_ref()).await {
            if let Err(close_err) = channel.close().await {
                error!(
                    error = close_err.to_string(),
                    channel = options.name,
                    "failure to close channel"
                );
            }
            return Err(err);
        }

        self.channels.insert(
            &options.name,
            options.topology.exchange_name(),
            options.direction,
            channel.clone(),
        );

        debug!(channel = options.name, "channel created");
        Ok(channel)
    }

    pub fn get_channel(
        &self,
        name: &str,
        direction: ChannelDirection,
    ) -> Option<&ChannelEntry<Arc<dyn AmqpChannel>>> {
        self.channels.get(name, direction)
    }

    /// Closes every channel, then the connection. Failures are logged only.
    pub async fn shutdown(&self) {
        debug!("amqp client shutdown");

        let closing = [ChannelDirection::Producer, ChannelDirection::Consumer]
            .into_iter()
            .flat_map(|direction| self.channels.iter(direction))
            .map(|(name, entry)| async move {
                if let Err(err) = entry.handle.close().await {
                    error!(error = err.to_string(), channel = name, "failure to close channel");
                }
            });
        join_all(closing).await;

        if let Some(connection) = &self.connection {
            if let Err(err) = connection.close().await {
                error!(error = err.to_string(), "failure to close connection");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{collections::VecDeque, sync::Mutex};

    pub(crate) fn connector_with(channels: Vec<MockAmqpChannel>) -> Arc<dyn AmqpConnector> {
        let channels = Arc::new(Mutex::new(VecDeque::from(channels)));

        let mut connection = MockAmqpConnection::new();
        connection.expect_create_channel().returning(move || {
            let channel = channels
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(QueueError::ChannelError("exhausted".to_owned()))?;
            Ok(Arc::new(channel))
        });
        connection.expect_close().returning(|| Ok(()));

        let connection: Arc<dyn AmqpConnection> = Arc::new(connection);
        let mut connector = MockAmqpConnector::new();
        connector
            .expect_connect()
            .returning(move |_| Ok(connection.clone()));
        Arc::new(connector)
    }

    fn producer_options(name: &str) -> RabbitMQChannelOptions {
        RabbitMQChannelOptions {
            name: name.to_owned(),
            direction: ChannelDirection::Producer,
            topology: Topology::exchange("orders", ExchangeKind::Topic, false),
        }
    }

    #[tokio::test]
    async fn should_require_connection_before_opening_channels() {
        let mut connector = MockAmqpConnector::new();
        connector
            .expect_connect()
            .returning(|_| Err(QueueError::ConnectionError));
        let mut client = RabbitMQClient::new(ConnectOptions::default(), Arc::new(connector));

        assert!(!client.connect().await);
        assert!(matches!(
            client.add_channel(&producer_options("p")).await,
            Err(QueueError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn should_register_only_provisioned_channels() {
        let mut ok = MockAmqpChannel::new();
        ok.expect_declare_exchange().returning(|_, _, _| Ok(()));

        let mut failing = MockAmqpChannel::new();
        failing
            .expect_declare_exchange()
            .returning(|name, _, _| Err(QueueError::DeclareExchangeError(name.to_owned())));
        failing.expect_close().times(1).returning(|| Ok(()));

        let mut client = RabbitMQClient::new(
            ConnectOptions::default(),
            connector_with(vec![ok, failing]),
        );
        assert!(client.connect().await);
        assert!(client.is_connected());

        assert!(client.add_channel(&producer_options("p1")).await.is_ok());
        assert_eq!(
            client.add_channel(&producer_options("p2")).await.err(),
            Some(QueueError::DeclareExchangeError("orders".to_owned()))
        );

        let entry = client.get_channel("p1", ChannelDirection::Producer).unwrap();
        assert_eq!(entry.destination, "orders");
        assert!(client.get_channel("p2", ChannelDirection::Producer).is_none());
    }

    #[tokio::test]
    async fn should_close_channels_and_connection() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_declare_exchange().returning(|_, _, _| Ok(()));
        channel
            .expect_close()
            .times(1)
            .returning(|| Err(QueueError::CloseError("p".to_owned())));

        let mut client =
            RabbitMQClient::new(ConnectOptions::default(), connector_with(vec![channel]));
        client.connect().await;
        client.add_channel(&producer_options("p")).await.unwrap();

        client.shutdown().await;
    }
}
