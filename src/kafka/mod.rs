// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Log broker transport: partitioned topics and consumer groups.

pub mod broker;
pub mod client;
mod service;

pub use client::{KafkaChannel, KafkaChannelOptions, KafkaClient};
pub use service::KafkaService;
