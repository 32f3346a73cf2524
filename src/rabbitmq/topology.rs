// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Topology
//!
//! What a channel asserts on the broker before it is usable: an exchange for
//! every channel, and for consumer channels a queue, a prefetch window and
//! one binding per routing key.

use super::client::AmqpChannel;
use crate::{
    errors::QueueError,
    exchange::{Arguments, ExchangeKind},
    queue::QueueDefinition,
};
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    exchange_name: String,
    exchange_kind: ExchangeKind,
    exchange_arguments: Arguments,
    queue: Option<QueueDefinition>,
    prefetch: Option<u16>,
    routing_keys: Vec<String>,
}

impl Topology {
    /// Starts a topology around the exchange every channel asserts.
    pub fn exchange(name: &str, kind: ExchangeKind, delayed_enabled: bool) -> Topology {
        Topology {
            exchange_name: name.to_owned(),
            exchange_arguments: kind.declare_arguments(delayed_enabled),
            exchange_kind: kind,
            queue: None,
            prefetch: None,
            routing_keys: vec![],
        }
    }

    /// Adds the queue the channel consumes from.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queue = Some(def);
        self
    }

    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = Some(count);
        self
    }

    /// Binds the queue to the exchange with `routing_key`.
    pub fn bind(mut self, routing_key: &str) -> Self {
        self.routing_keys.push(routing_key.to_owned());
        self
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn queue_name(&self) -> Option<&str> {
        self.queue.as_ref().map(QueueDefinition::name)
    }

    /// Asserts the exchange, then the queue, the prefetch window and the
    /// bindings, stopping at the first failure.
    pub async fn install(&self, channel: &dyn AmqpChannel) -> Result<(), QueueError> {
        debug!("creating exchange: {}", self.exchange_name);
        channel
            .declare_exchange(
                &self.exchange_name,
                &self.exchange_kind,
                &self.exchange_arguments,
            )
            .await?;

        let Some(queue) = &self.queue else {
            return Ok(());
        };

        debug!("creating queue: {}", queue.name());
        channel.declare_queue(queue).await?;

        if let Some(count) = self.prefetch {
            channel.set_prefetch(count).await?;
        }

        for routing_key in &self.routing_keys {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                queue.name(),
                self.exchange_name,
                routing_key
            );

            if let Err(err) = channel
                .bind_queue(queue.name(), &self.exchange_name, routing_key)
                .await
            {
                error!(error = err.to_string(), "error to bind queue to exchange");
                return Err(err);
            }
        }

        Ok(())
    }
}
