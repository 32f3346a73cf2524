// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # lapin Adapter
//!
//! Production implementations of the AMQP traits on top of `lapin`.

use super::client::{
    AmqpChannel, AmqpConnection, AmqpConnector, DeliveryStream, InboundDelivery,
};
use crate::{
    config::ConnectOptions,
    errors::QueueError,
    exchange::{Arguments, ExchangeKind},
    message::{Envelope, Headers, JSON_CONTENT_TYPE, X_DELAY_HEADER},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Builds the AMQP URI from the connect options.
///
/// The host may already carry a scheme; otherwise `amqps` is used with TLS
/// and `amqp` without.
pub(crate) fn connection_uri(options: &ConnectOptions) -> String {
    let (scheme, host) = match options.host.split_once("://") {
        Some((scheme, host)) => (scheme, host),
        None if options.tls => ("amqps", options.host.as_str()),
        None => ("amqp", options.host.as_str()),
    };

    let credentials = match (&options.username, &options.password) {
        (Some(user), Some(password)) => format!("{}:{}@", user, password),
        (Some(user), None) => format!("{}@", user),
        _ => String::new(),
    };

    format!(
        "{}://{}{}:{}?heartbeat={}",
        scheme, credentials, host, options.port, options.heartbeat
    )
}

fn field_table(arguments: &Arguments) -> FieldTable {
    let table: BTreeMap<ShortString, AMQPValue> = arguments
        .iter()
        .map(|(key, value)| {
            (
                ShortString::from(key.as_str()),
                AMQPValue::LongString(LongString::from(value.as_str())),
            )
        })
        .collect();
    FieldTable::from(table)
}

/// Message headers as AMQP values; the delay directive must be an integer
/// for the delayed-message exchange to honor it.
pub(crate) fn amqp_headers(headers: &Headers) -> FieldTable {
    let mut table = BTreeMap::new();
    for (key, value) in headers {
        let amqp_value = match (key.as_str(), value.parse::<i64>()) {
            (X_DELAY_HEADER, Ok(ms)) => AMQPValue::LongLongInt(LongLongInt::from(ms)),
            _ => AMQPValue::LongString(LongString::from(value.as_str())),
        };
        table.insert(ShortString::from(key.as_str()), amqp_value);
    }
    FieldTable::from(table)
}

/// Reads message headers, keeping the ones with a textual or numeric value.
pub(crate) fn inbound_headers(table: Option<&FieldTable>) -> Headers {
    let mut headers = Headers::new();
    let Some(table) = table else {
        return headers;
    };

    for (key, value) in table.inner() {
        let value = match value {
            AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes()).into_owned(),
            AMQPValue::ShortString(v) => v.as_str().to_owned(),
            AMQPValue::LongLongInt(v) => v.to_string(),
            AMQPValue::LongInt(v) => v.to_string(),
            AMQPValue::LongUInt(v) => v.to_string(),
            AMQPValue::ShortInt(v) => v.to_string(),
            AMQPValue::Boolean(v) => v.to_string(),
            _ => {
                debug!(header = key.as_str(), "skipping header with unsupported value");
                continue;
            }
        };
        headers.insert(key.as_str().to_owned(), value);
    }

    headers
}

fn inbound_delivery(delivery: Delivery) -> InboundDelivery {
    InboundDelivery {
        delivery_tag: delivery.delivery_tag,
        envelope: Envelope {
            headers: inbound_headers(delivery.properties.headers().as_ref()),
            payload: delivery.data,
            key: None,
        },
    }
}

pub struct LapinConnector;

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn AmqpConnection>, QueueError> {
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(options.client_id.clone()));

        match Connection::connect(&connection_uri(options), properties).await {
            Ok(connection) => Ok(Arc::new(LapinConnection { connection })),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(QueueError::ConnectionError)
            }
        }
    }
}

struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, QueueError> {
        match self.connection.create_channel().await {
            Ok(channel) => Ok(Arc::new(LapinChannel { channel })),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(QueueError::ChannelError(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| QueueError::CloseError(err.to_string()))
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: &ExchangeKind,
        arguments: &Arguments,
    ) -> Result<(), QueueError> {
        match self
            .channel
            .exchange_declare(
                name,
                kind.into(),
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                field_table(arguments),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = name,
                    "error to declare the exchange"
                );
                Err(QueueError::DeclareExchangeError(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), QueueError> {
        match self
            .channel
            .queue_declare(
                def.name(),
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                field_table(&def.arguments()),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = def.name(), "failure to declare queue");
                Err(QueueError::DeclareQueueError(def.name().to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), QueueError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to set prefetch");
                QueueError::QoSDeclarationError(err.to_string())
            })
    }

    async fn bind_queue(
        &self,
        queue_name: &str,
        exchange_name: &str,
        routing_key: &str,
    ) -> Result<(), QueueError> {
        self.channel
            .queue_bind(
                queue_name,
                exchange_name,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|_| {
                QueueError::BindingExchangeToQueueError(
                    exchange_name.to_owned(),
                    queue_name.to_owned(),
                )
            })
    }

    async fn publish(
        &self,
        exchange_name: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), QueueError> {
        match self
            .channel
            .basic_publish(
                exchange_name,
                routing_key,
                BasicPublishOptions::default(),
                &envelope.payload,
                BasicProperties::default()
                    .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
                    .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
                    .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
                    .with_headers(amqp_headers(&envelope.headers)),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(QueueError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(
        &self,
        queue_name: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, QueueError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue_name,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(QueueError::ConsumerDeclarationError(queue_name.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| {
                result
                    .map(inbound_delivery)
                    .map_err(|err| QueueError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), QueueError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                QueueError::AckMessageError
            })
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| QueueError::CloseError(err.to_string()))
    }
}
