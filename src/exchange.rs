// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! This module provides the exchange types understood by the exchange broker
//! and the arguments sent along with an exchange assertion. On the log broker
//! the exchange name only contributes to the derived topic name, so the kind
//! is carried but otherwise ignored there.

use crate::errors::QueueError;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// Constant for the argument used to specify the underlying delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Exchange type name registered by the delayed message plugin
pub const DELAYED_MESSAGE_EXCHANGE: &str = "x-delayed-message";

/// Arguments attached to an exchange or queue assertion.
pub type Arguments = BTreeMap<String, String>;

/// Represents the types of exchanges a channel can be bound to.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - XMessageDelayed: Extension for delayed message delivery (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XMessageDelayed,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::XMessageDelayed => DELAYED_MESSAGE_EXCHANGE,
        }
    }

    /// Builds the arguments for asserting an exchange of this kind.
    ///
    /// Delayed exchanges route like direct exchanges once the delay elapses;
    /// the plugin needs that told explicitly, but only when delayed messages
    /// are enabled for the deployment.
    pub fn declare_arguments(&self, delayed_enabled: bool) -> Arguments {
        let mut args = Arguments::new();
        if delayed_enabled && *self == ExchangeKind::XMessageDelayed {
            args.insert(
                AMQP_HEADERS_DELAYED_EXCHANGE_TYPE.to_owned(),
                ExchangeKind::Direct.as_str().to_owned(),
            );
        }
        args
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = QueueError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "" | "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            DELAYED_MESSAGE_EXCHANGE => Ok(ExchangeKind::XMessageDelayed),
            other => Err(QueueError::ConfigError(format!(
                "unknown exchange type `{}`",
                other
            ))),
        }
    }
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    /// Converts the internal ExchangeKind to lapin's ExchangeKind.
    ///
    /// The delayed exchange is a plugin type, so it goes through lapin's
    /// custom variant.
    fn from(kind: &ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom(DELAYED_MESSAGE_EXCHANGE.to_owned())
            }
        }
    }
}
