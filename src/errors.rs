// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Queue Bridge
//!
//! This module provides the error type shared by both transports. The
//! `QueueError` enum covers configuration, connection, provisioning,
//! publishing and consuming failures, regardless of which broker SDK raised
//! them.

use thiserror::Error;

/// Represents errors that can occur while provisioning channels, publishing or
/// consuming messages on either transport.
///
/// SDK errors are logged at the adapter boundary and converted into one of
/// these variants, so callers never see `lapin` or `rdkafka` types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Invalid or incomplete configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// The transport was used before a connection was established
    #[error("transport is not connected")]
    NotConnected,

    /// Error creating a channel from an established connection
    #[error("failure to create channel `{0}`")]
    ChannelError(String),

    /// Publishing or subscribing through a channel that was never registered
    #[error("channel `{0}` not found")]
    ChannelNotFound(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error subscribing a log consumer to a topic
    #[error("failure to subscribe to topic `{0}`")]
    SubscribeError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error serializing a message payload
    #[error("failure to serialize payload: {0}")]
    SerializationError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error receiving a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error raised by an application handler
    #[error("handler failure: {0}")]
    HandlerError(String),

    /// Error closing a channel or connection
    #[error("failure to close `{0}`")]
    CloseError(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::SerializationError(err.to_string())
    }
}

impl From<config::ConfigError> for QueueError {
    fn from(err: config::ConfigError) -> Self {
        QueueError::ConfigError(err.to_string())
    }
}
