// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! Application code attaches handlers to a channel's logical name. Every
//! handler registered for a channel sees every message consumed on it; one
//! delivery attempt runs all of them concurrently and succeeds only when all
//! of them do.

use crate::{errors::QueueError, message::Headers};
use async_trait::async_trait;
use futures_util::future::join_all;
use opentelemetry::Context;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;

/// Handler invoked for each delivery attempt of a consumed message.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Processes one message.
    ///
    /// # Parameters
    /// * `ctx` - Context carrying the consumer span for this message
    /// * `msg` - Deserialized payload
    /// * `attempt` - Zero-based delivery attempt
    /// * `headers` - Message metadata as received
    async fn exec(
        &self,
        ctx: &Context,
        msg: &Value,
        attempt: u32,
        headers: &Headers,
    ) -> Result<(), QueueError>;
}

/// Subscription table: channel name to the ordered handlers attached to it.
#[derive(Clone, Default)]
pub struct Subscriptions {
    table: Arc<RwLock<HashMap<String, Vec<Arc<dyn ConsumerHandler>>>>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `handler` to the handlers of `channel`.
    pub async fn register(&self, channel: &str, handler: Arc<dyn ConsumerHandler>) {
        self.table
            .write()
            .await
            .entry(channel.to_owned())
            .or_default()
            .push(handler);
    }

    pub async fn handlers(&self, channel: &str) -> Vec<Arc<dyn ConsumerHandler>> {
        self.table
            .read()
            .await
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Runs one delivery attempt: every handler of `channel`, concurrently.
    ///
    /// Returns the first failure, if any handler failed. A channel without
    /// handlers counts as handled.
    pub async fn dispatch(
        &self,
        channel: &str,
        ctx: &Context,
        msg: &Value,
        attempt: u32,
        headers: &Headers,
    ) -> Result<(), QueueError> {
        let handlers = self.handlers(channel).await;

        join_all(
            handlers
                .iter()
                .map(|handler| handler.exec(ctx, msg, attempt, headers)),
        )
        .await
        .into_iter()
        .collect()
    }
}
