// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # rdkafka Adapter
//!
//! Production implementations of the log broker traits on top of `rdkafka`.
//! Producers use the Java-compatible murmur2 partitioner. Consumers
//! auto-commit only offsets stored explicitly once a record is finished, and
//! start from the latest offset when their group has none.

use super::client::{InboundRecord, LogBroker, LogConnector, LogConsumer, LogProducer};
use crate::{
    config::{AuthMechanism, ConnectOptions},
    errors::QueueError,
    message::{Envelope, Headers},
};
use async_trait::async_trait;
use rdkafka::{
    config::{ClientConfig, RDKafkaLogLevel},
    consumer::{Consumer, StreamConsumer},
    message::{BorrowedMessage, Header, Headers as _, OwnedHeaders},
    producer::{FutureProducer, FutureRecord, Producer},
    Message,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the client configuration shared by every producer and consumer.
pub(crate) fn client_config(options: &ConnectOptions) -> Result<ClientConfig, QueueError> {
    if options.brokers.is_empty() {
        error!("no kafka brokers configured");
        return Err(QueueError::ConfigError("no brokers configured".to_owned()));
    }

    let mut cfg = ClientConfig::new();
    cfg.set("bootstrap.servers", options.brokers.join(","))
        .set("client.id", &options.client_id);

    let protocol = match (&options.auth, options.tls) {
        (AuthMechanism::None, false) => "PLAINTEXT",
        (AuthMechanism::None, true) => "SSL",
        (_, false) => "SASL_PLAINTEXT",
        (_, true) => "SASL_SSL",
    };
    cfg.set("security.protocol", protocol);

    match &options.auth {
        AuthMechanism::None => {}
        AuthMechanism::Plain { username, password } => {
            cfg.set("sasl.mechanism", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }
        AuthMechanism::OAuthBearer => {
            cfg.set("sasl.mechanism", "OAUTHBEARER");
        }
        AuthMechanism::Iam { .. } => {
            error!("iam sasl mechanism is not supported by the kafka client");
            return Err(QueueError::ConfigError(
                "iam sasl mechanism is not supported by the kafka client".to_owned(),
            ));
        }
    }

    if let Some(level) = &options.log_level {
        cfg.set_log_level(log_level(level));
    }

    Ok(cfg)
}

fn log_level(level: &str) -> RDKafkaLogLevel {
    match level.to_uppercase().as_str() {
        "NOTHING" | "ERROR" => RDKafkaLogLevel::Error,
        "WARN" => RDKafkaLogLevel::Warning,
        "DEBUG" => RDKafkaLogLevel::Debug,
        _ => RDKafkaLogLevel::Info,
    }
}

/// Consumer settings on top of the shared client configuration.
///
/// Offsets are stored by the receive loop once a record's retry loop is over,
/// so auto-commit never moves past a record still being handled.
fn consumer_config(base: &ClientConfig, group_id: &str) -> ClientConfig {
    let mut cfg = base.clone();
    cfg.set("group.id", group_id)
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false")
        .set("auto.offset.reset", "latest");
    cfg
}

pub struct RdKafkaConnector;

#[async_trait]
impl LogConnector for RdKafkaConnector {
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn LogBroker>, QueueError> {
        let base = client_config(options)?;
        Ok(Arc::new(RdKafkaBroker { base }))
    }
}

struct RdKafkaBroker {
    base: ClientConfig,
}

impl LogBroker for RdKafkaBroker {
    fn producer(&self) -> Result<Arc<dyn LogProducer>, QueueError> {
        let producer: FutureProducer = self
            .base
            .clone()
            .set("partitioner", "murmur2_random")
            .create()
            .map_err(|err| {
                error!(error = err.to_string(), "failure to create producer");
                QueueError::ChannelError("producer".to_owned())
            })?;

        Ok(Arc::new(RdKafkaProducer { producer }))
    }

    fn consumer(&self, group_id: &str) -> Result<Arc<dyn LogConsumer>, QueueError> {
        let consumer: StreamConsumer = consumer_config(&self.base, group_id)
            .create()
            .map_err(|err| {
                error!(error = err.to_string(), group_id, "failure to create consumer");
                QueueError::ChannelError(group_id.to_owned())
            })?;

        Ok(Arc::new(RdKafkaConsumer {
            consumer: Arc::new(consumer),
        }))
    }
}

struct RdKafkaProducer {
    producer: FutureProducer,
}

#[async_trait]
impl LogProducer for RdKafkaProducer {
    async fn connect(&self) -> Result<(), QueueError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, METADATA_TIMEOUT)
                .map(|_| ())
        })
        .await
        .map_err(|_| QueueError::InternalError)?
        .map_err(|err| {
            error!(error = err.to_string(), "failure to connect producer");
            QueueError::ConnectionError
        })
    }

    async fn send(&self, topic: &str, envelope: &Envelope) -> Result<(), QueueError> {
        let headers = envelope
            .headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_bytes()),
                })
            });

        let mut record: FutureRecord<'_, str, [u8]> = FutureRecord::to(topic)
            .payload(envelope.payload.as_slice())
            .headers(headers);
        if let Some(key) = &envelope.key {
            record = record.key(key.as_str());
        }

        match self.producer.send(record, Duration::from_secs(0)).await {
            Ok((partition, offset)) => {
                debug!(topic, partition, offset, "record delivered");
                Ok(())
            }
            Err((err, _)) => {
                error!(error = err.to_string(), topic, "error publishing message");
                Err(QueueError::PublishingError(err.to_string()))
            }
        }
    }

    async fn disconnect(&self) -> Result<(), QueueError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(FLUSH_TIMEOUT))
            .await
            .map_err(|_| QueueError::InternalError)?
            .map_err(|err| QueueError::CloseError(err.to_string()))
    }
}

struct RdKafkaConsumer {
    consumer: Arc<StreamConsumer>,
}

#[async_trait]
impl LogConsumer for RdKafkaConsumer {
    async fn connect(&self) -> Result<(), QueueError> {
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || {
            consumer
                .client()
                .fetch_metadata(None, METADATA_TIMEOUT)
                .map(|_| ())
        })
        .await
        .map_err(|_| QueueError::InternalError)?
        .map_err(|err| {
            error!(error = err.to_string(), "failure to connect consumer");
            QueueError::ConnectionError
        })
    }

    async fn subscribe(&self, topic: &str) -> Result<(), QueueError> {
        self.consumer.subscribe(&[topic]).map_err(|err| {
            error!(error = err.to_string(), topic, "failure to subscribe");
            QueueError::SubscribeError(topic.to_owned())
        })
    }

    async fn recv(&self) -> Result<Option<InboundRecord>, QueueError> {
        match self.consumer.recv().await {
            Ok(msg) => Ok(Some(inbound_record(&msg))),
            Err(err) => Err(QueueError::ConsumerError(err.to_string())),
        }
    }

    async fn store_offset(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<(), QueueError> {
        self.consumer
            .store_offset(topic, partition, offset)
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    topic, partition, offset, "failure to store offset"
                );
                QueueError::ConsumerError(err.to_string())
            })
    }

    async fn disconnect(&self) -> Result<(), QueueError> {
        self.consumer.unsubscribe();
        Ok(())
    }
}

fn inbound_record(msg: &BorrowedMessage<'_>) -> InboundRecord {
    let mut headers = Headers::new();
    if let Some(borrowed) = msg.headers() {
        for header in borrowed.iter() {
            if let Some(value) = header.value {
                headers.insert(
                    header.key.to_owned(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }
    }

    InboundRecord {
        topic: msg.topic().to_owned(),
        partition: msg.partition(),
        offset: msg.offset(),
        envelope: Envelope {
            payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            headers,
            key: msg
                .key()
                .map(|key| String::from_utf8_lossy(key).into_owned()),
        },
    }
}
