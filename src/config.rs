// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Configuration
//!
//! Declarative description of the broker connection and of every channel the
//! process provisions at startup. `QueueConfig::from_env` reads the `MQ_*`
//! environment variables through the `config` crate; applications that wire
//! their own declarations can build the structs directly.

use crate::{errors::QueueError, exchange::ExchangeKind, queue::QueueType};
use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};
use tracing::debug;

/// Consume channel fed by the transaction send exchange
pub const SUBSCRIBE_TRANSACTION_SEND: &str = "subscribe.transaction.send";
/// Publish channel for the transaction send exchange
pub const PUBLISH_TRANSACTION_SEND: &str = "publish.transaction.send";
/// Publish channel for the transaction history exchange
pub const PUBLISH_TRANSACTION_HISTORY: &str = "publish.transaction.history";
/// Publish channel for the transaction callback exchange
pub const PUBLISH_TRANSACTION_CALLBACK: &str = "publish.transaction.callback";
/// Publish channel for the event subscription exchange
pub const PUBLISH_EVENT_SUBSCRIPTION: &str = "publish.event.subscription";

const DEFAULT_DELIVERY_LIMIT: u32 = 10;
const DEFAULT_DELIVERY_PERIOD_MS: u64 = 1000;
const DEFAULT_HEARTBEAT_SECS: u16 = 5;
const DEFAULT_AMQP_PORT: u16 = 5672;
const DEFAULT_CLIENT_ID: &str = "queue-bridge";

/// Which broker model backs the queue service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    #[default]
    Kafka,
    RabbitMQ,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Kafka => "kafka",
            TransportKind::RabbitMQ => "rabbitmq",
        }
    }
}

impl FromStr for TransportKind {
    type Err = QueueError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_uppercase().as_str() {
            "" | "KAFKA" => Ok(TransportKind::Kafka),
            "RABBITMQ" => Ok(TransportKind::RabbitMQ),
            other => Err(QueueError::ConfigError(format!(
                "unknown transport `{}`",
                other
            ))),
        }
    }
}

/// Authentication mechanism used against the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMechanism {
    /// Anonymous, or credentials embedded in the connection URI.
    #[default]
    None,
    Plain {
        username: String,
        password: String,
    },
    OAuthBearer,
    /// Cloud IAM-style credentials.
    Iam {
        authorization_identity: Option<String>,
        access_key_id: String,
        secret_access_key: String,
        session_token: Option<String>,
    },
}

/// Broker connection settings. Immutable once the service has started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// Exchange broker host, optionally carrying a scheme (`amqps://host`).
    pub host: String,
    pub port: u16,
    /// Log broker bootstrap servers.
    pub brokers: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub auth: AuthMechanism,
    pub tls: bool,
    pub client_id: String,
    pub heartbeat: u16,
    /// Log broker client log level (`ERROR`, `WARN`, `INFO`, `DEBUG`).
    pub log_level: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            host: "127.0.0.1".to_owned(),
            port: DEFAULT_AMQP_PORT,
            brokers: vec![],
            username: None,
            password: None,
            auth: AuthMechanism::None,
            tls: false,
            client_id: DEFAULT_CLIENT_ID.to_owned(),
            heartbeat: DEFAULT_HEARTBEAT_SECS,
            log_level: None,
        }
    }
}

/// A channel the process consumes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeDeclaration {
    pub name: String,
    pub exchange_name: String,
    pub exchange_type: ExchangeKind,
    pub queue_name: String,
    pub queue_type: QueueType,
    pub prefetch: u16,
    pub routing_keys: Vec<String>,
    pub auto_commit: bool,
}

/// A channel the process publishes through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishDeclaration {
    pub name: String,
    pub exchange_name: String,
    pub exchange_type: ExchangeKind,
}

/// Bounded in-process redelivery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DeliveryPolicyFields")]
pub struct DeliveryPolicy {
    limit: u32,
    period_ms: u64,
}

#[derive(Deserialize)]
struct DeliveryPolicyFields {
    limit: u32,
    period_ms: u64,
}

impl TryFrom<DeliveryPolicyFields> for DeliveryPolicy {
    type Error = QueueError;

    fn try_from(fields: DeliveryPolicyFields) -> Result<Self, Self::Error> {
        DeliveryPolicy::new(fields.limit, fields.period_ms)
    }
}

impl DeliveryPolicy {
    /// Builds a policy; `limit` must allow at least one attempt.
    pub fn new(limit: u32, period_ms: u64) -> Result<DeliveryPolicy, QueueError> {
        if limit == 0 {
            return Err(QueueError::ConfigError(
                "delivery limit must be at least 1".to_owned(),
            ));
        }
        Ok(DeliveryPolicy { limit, period_ms })
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        DeliveryPolicy {
            limit: DEFAULT_DELIVERY_LIMIT,
            period_ms: DEFAULT_DELIVERY_PERIOD_MS,
        }
    }
}

/// Everything the queue service needs to provision and run its channels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub transport: TransportKind,
    pub connect: ConnectOptions,
    pub consume: Vec<ConsumeDeclaration>,
    pub publish: Vec<PublishDeclaration>,
    pub delivery: DeliveryPolicy,
    pub enable_delayed_message: bool,
}

impl QueueConfig {
    /// Reads the configuration from `MQ_*` environment variables.
    pub fn from_env() -> Result<QueueConfig, QueueError> {
        let source = Config::builder()
            .add_source(Environment::default())
            .build()?;
        QueueConfig::from_source(&source)
    }

    /// Reads the configuration from an already built `config::Config`.
    ///
    /// Keys are the lower-cased environment variable names (`mq_host`).
    pub fn from_source(source: &Config) -> Result<QueueConfig, QueueError> {
        let reader = Reader(source);

        let queue_type: QueueType = reader.parse_or("mq_queue_type", QueueType::default())?;

        let consume = vec![reader.consume(
            SUBSCRIBE_TRANSACTION_SEND,
            "mq_transaction_send",
            &queue_type,
        )?];

        let publish = vec![
            reader.publish(PUBLISH_TRANSACTION_SEND, "mq_transaction_send")?,
            reader.publish(PUBLISH_TRANSACTION_HISTORY, "mq_transaction_history_record")?,
            reader.publish(PUBLISH_TRANSACTION_CALLBACK, "mq_transaction_callback")?,
            reader.publish(PUBLISH_EVENT_SUBSCRIPTION, "mq_event_subscription")?,
        ];

        let config = QueueConfig {
            transport: reader.parse_or("mq_type", TransportKind::default())?,
            connect: reader.connect_options()?,
            consume,
            publish,
            delivery: DeliveryPolicy::new(
                reader.parse_or("mq_delivery_limit", DEFAULT_DELIVERY_LIMIT)?,
                reader.parse_or("mq_delivery_period", DEFAULT_DELIVERY_PERIOD_MS)?,
            )?,
            enable_delayed_message: reader.flag("mq_enable_delayed_message")?,
        };

        debug!(
            transport = config.transport.as_str(),
            consume = config.consume.len(),
            publish = config.publish.len(),
            "queue options loaded"
        );

        Ok(config)
    }

    /// Finds the publish declaration registered under `name`.
    pub fn publish_declaration(&self, name: &str) -> Option<&PublishDeclaration> {
        self.publish.iter().find(|decl| decl.name == name)
    }
}

struct Reader<'a>(&'a Config);

impl Reader<'_> {
    fn string(&self, key: &str) -> Option<String> {
        self.0
            .get_string(key)
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
    }

    fn parse_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, QueueError> {
        match self.string(key) {
            None => Ok(default),
            Some(value) => value.parse::<T>().map_err(|_| {
                QueueError::ConfigError(format!("invalid value `{}` for `{}`", value, key))
            }),
        }
    }

    fn flag(&self, key: &str) -> Result<bool, QueueError> {
        self.parse_or(key, false)
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.string(key)
            .map(|value| {
                value
                    .split(',')
                    .map(|item| item.trim().to_owned())
                    .filter(|item| !item.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn connect_options(&self) -> Result<ConnectOptions, QueueError> {
        let username = self.string("mq_username");
        let password = self.string("mq_password");

        let mechanism = self.string("mq_sasl_mechanism").map(|value| value.to_lowercase());
        let auth = match mechanism.as_deref() {
            None => AuthMechanism::None,
            Some("plain") => AuthMechanism::Plain {
                username: username.clone().unwrap_or_default(),
                password: password.clone().unwrap_or_default(),
            },
            Some("oauthbearer") => AuthMechanism::OAuthBearer,
            Some("aws") => AuthMechanism::Iam {
                authorization_identity: self.string("mq_sasl_auth_id"),
                access_key_id: self.string("mq_sasl_access_key_id").unwrap_or_default(),
                secret_access_key: self.string("mq_sasl_access_key").unwrap_or_default(),
                session_token: self.string("mq_sasl_session_token"),
            },
            Some(other) => {
                return Err(QueueError::ConfigError(format!(
                    "unknown sasl mechanism `{}`",
                    other
                )))
            }
        };

        Ok(ConnectOptions {
            host: self.string("mq_host").unwrap_or_else(|| "127.0.0.1".to_owned()),
            port: self.parse_or("mq_port", DEFAULT_AMQP_PORT)?,
            brokers: self.list("mq_brokers"),
            username,
            password,
            auth,
            tls: self.flag("mq_ssl")?,
            client_id: self
                .string("mq_client_id")
                .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_owned()),
            heartbeat: self.parse_or("mq_heartbeat", DEFAULT_HEARTBEAT_SECS)?,
            log_level: self.string("mq_log_level"),
        })
    }

    fn consume(
        &self,
        name: &str,
        prefix: &str,
        queue_type: &QueueType,
    ) -> Result<ConsumeDeclaration, QueueError> {
        Ok(ConsumeDeclaration {
            name: name.to_owned(),
            exchange_name: self
                .string(&format!("{}_exchange_name", prefix))
                .unwrap_or_default(),
            exchange_type: self.parse_or(
                &format!("{}_exchange_type", prefix),
                ExchangeKind::default(),
            )?,
            queue_name: self
                .string(&format!("{}_queue_name", prefix))
                .unwrap_or_default(),
            queue_type: queue_type.clone(),
            prefetch: self.parse_or(&format!("{}_queue_prefetch", prefix), 1)?,
            routing_keys: self.list(&format!("{}_routing_keys", prefix)),
            auto_commit: false,
        })
    }

    fn publish(&self, name: &str, prefix: &str) -> Result<PublishDeclaration, QueueError> {
        Ok(PublishDeclaration {
            name: name.to_owned(),
            exchange_name: self
                .string(&format!("{}_exchange_name", prefix))
                .unwrap_or_default(),
            exchange_type: self.parse_or(
                &format!("{}_exchange_type", prefix),
                ExchangeKind::default(),
            )?,
        })
    }
}
