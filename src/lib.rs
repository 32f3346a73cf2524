// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # queue-bridge
//!
//! One publish/subscribe contract over either a log broker (Kafka) or an
//! exchange broker (RabbitMQ), with at-least-once delivery, bounded
//! in-process redelivery, delayed publish and trace-context propagation
//! through message headers.
//!
//! ```no_run
//! use queue_bridge::{config::QueueConfig, message::PublishOptions, service};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), queue_bridge::errors::QueueError> {
//! let mut queue = service::build(QueueConfig::from_env()?);
//! queue.start().await;
//! queue
//!     .publish(
//!         &json!({"id": "cat-1"}),
//!         &PublishOptions::new("publish.transaction.send").routing_key("created"),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod consumer;

pub mod channel;
pub mod config;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod kafka;
pub mod message;
pub mod otel;
pub mod queue;
pub mod rabbitmq;
pub mod service;

pub use service::{build, QueueService};
