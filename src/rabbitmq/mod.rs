// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Exchange broker transport: exchanges, bound queues and acknowledgements.

pub mod amqp;
pub mod client;
mod service;
pub mod topology;

pub use client::{RabbitMQChannelOptions, RabbitMQClient};
pub use service::RabbitMQService;
