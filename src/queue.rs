// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Queue types and the arguments used when a consumer asserts its queue on
//! the exchange broker.

use crate::{errors::QueueError, exchange::Arguments};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Constant for the argument used to select the queue implementation
pub const AMQP_HEADERS_QUEUE_TYPE: &str = "x-queue-type";

/// Queue implementations offered by the exchange broker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueType {
    #[default]
    Classic,
    Quorum,
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Classic => "classic",
            QueueType::Quorum => "quorum",
        }
    }
}

impl FromStr for QueueType {
    type Err = QueueError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "" | "classic" => Ok(QueueType::Classic),
            "quorum" => Ok(QueueType::Quorum),
            other => Err(QueueError::ConfigError(format!(
                "unknown queue type `{}`",
                other
            ))),
        }
    }
}

/// Definition of a consumer queue: always durable, typed via `x-queue-type`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) queue_type: QueueType,
}

impl QueueDefinition {
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            queue_type: QueueType::default(),
        }
    }

    /// Sets the queue implementation.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue_type(mut self, queue_type: QueueType) -> Self {
        self.queue_type = queue_type;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arguments sent with the queue assertion.
    pub fn arguments(&self) -> Arguments {
        let mut args = Arguments::new();
        args.insert(
            AMQP_HEADERS_QUEUE_TYPE.to_owned(),
            self.queue_type.as_str().to_owned(),
        );
        args
    }
}
