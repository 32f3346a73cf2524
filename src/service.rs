// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Service
//!
//! The publish/subscribe contract application code programs against. One
//! implementation exists per broker model; `build` picks one from the
//! configuration at startup and the choice never changes afterwards.

use crate::{
    config::{QueueConfig, TransportKind},
    errors::QueueError,
    handler::ConsumerHandler,
    kafka::{broker::RdKafkaConnector, KafkaService},
    message::PublishOptions,
    rabbitmq::{amqp::LapinConnector, RabbitMQService},
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

#[async_trait]
pub trait QueueService: Send + Sync {
    fn transport(&self) -> TransportKind;

    /// Attaches `handler` to the logical channel `channel`.
    ///
    /// Handlers should be registered before `start`, otherwise messages
    /// arriving in between are consumed without them.
    async fn subscribe(&self, channel: &str, handler: Arc<dyn ConsumerHandler>);

    /// Connects and provisions every declared channel, then starts the
    /// receive loops.
    ///
    /// Connection and provisioning failures are logged and leave the
    /// affected channels absent; they never abort startup.
    async fn start(&mut self);

    /// Publishes one JSON message through the producer channel named in
    /// `options`. Transport errors are returned as-is, without retry.
    async fn publish(&self, message: &Value, options: &PublishOptions) -> Result<(), QueueError>;

    /// Waits until every receive loop has ended.
    async fn consume_blocking(&self);

    /// Stops the receive loops and closes every channel and the connection.
    async fn shutdown(&self);
}

/// Builds the queue service selected by `config.transport`.
pub fn build(config: QueueConfig) -> Box<dyn QueueService> {
    match config.transport {
        TransportKind::Kafka => Box::new(KafkaService::new(config, Arc::new(RdKafkaConnector))),
        TransportKind::RabbitMQ => {
            Box::new(RabbitMQService::new(config, Arc::new(LapinConnector)))
        }
    }
}
