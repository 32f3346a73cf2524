// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumption
//!
//! This module holds the consume path shared by both transports:
//! 1. Open a consumer span parented on the propagated context
//! 2. Deserialize the payload
//! 3. Drive the channel's handlers through bounded in-process retry
//! 4. Close the span
//!
//! Acknowledgement stays with the transport, since only it knows whether the
//! broker already forgot the message (auto-commit) or waits for an ack.

use crate::{
    config::DeliveryPolicy,
    errors::QueueError,
    handler::Subscriptions,
    message::Headers,
    otel::{self, TRACER_NAME},
};
use opentelemetry::{
    global,
    trace::{Status, TraceContextExt},
    Context,
};
use serde_json::Value;
use std::borrow::Cow;
use tracing::{debug, error, info};

/// Everything a receive loop needs to hand messages to the application.
#[derive(Clone)]
pub(crate) struct ConsumerDefinition {
    /// Logical channel name the handlers are registered under.
    pub(crate) name: String,
    /// Broker-side destination, used to name the consumer span.
    pub(crate) destination: String,
    pub(crate) system: &'static str,
    pub(crate) auto_commit: bool,
    pub(crate) policy: DeliveryPolicy,
    pub(crate) subscriptions: Subscriptions,
}

/// Result of running the retry loop for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub attempts: u32,
    pub handled: bool,
}

/// Consumes one raw message.
///
/// # Returns
/// The delivery outcome, or `ParsePayloadError` if the payload is not JSON.
/// Either way the message is finished from the broker's point of view.
pub(crate) async fn consume(
    def: &ConsumerDefinition,
    payload: &[u8],
    headers: &Headers,
) -> Result<DeliveryOutcome, QueueError> {
    let tracer = global::tracer(TRACER_NAME);
    let cx = otel::start_consumer_span(&tracer, def.system, &def.destination, headers);

    debug!(channel = def.name, destination = def.destination, "received");

    let msg: Value = match serde_json::from_slice(payload) {
        Ok(msg) => msg,
        Err(err) => {
            error!(
                error = err.to_string(),
                channel = def.name,
                "dropping message - reason: invalid payload"
            );
            cx.span().record_error(&err);
            cx.span().set_status(Status::Error {
                description: Cow::from("invalid payload"),
            });
            cx.span().end();
            return Err(QueueError::ParsePayloadError);
        }
    };

    let outcome = deliver(def, &cx, &msg, headers).await;

    if outcome.handled {
        cx.span().set_status(Status::Ok);
    } else {
        cx.span().set_status(Status::Error {
            description: Cow::from("delivery attempts exhausted"),
        });
    }
    cx.span().end();

    Ok(outcome)
}

/// Runs the bounded retry loop.
///
/// Each attempt invokes every handler of the channel. Auto-commit channels
/// get a single attempt; others sleep `policy.period()` between attempts, but
/// not after the last one.
pub(crate) async fn deliver(
    def: &ConsumerDefinition,
    cx: &Context,
    msg: &Value,
    headers: &Headers,
) -> DeliveryOutcome {
    let limit = def.policy.limit();
    let mut attempts = 0;

    for attempt in 0..limit {
        attempts += 1;

        match def
            .subscriptions
            .dispatch(&def.name, cx, msg, attempt, headers)
            .await
        {
            Ok(()) => {
                info!(channel = def.name, attempt, "ACK");
                return DeliveryOutcome {
                    attempts,
                    handled: true,
                };
            }
            Err(err) => {
                error!(error = err.to_string(), channel = def.name, attempt, "NACK");
                cx.span().record_error(&err);

                if def.auto_commit {
                    break;
                }

                if attempt + 1 < limit {
                    tokio::time::sleep(def.policy.period()).await;
                }
            }
        }
    }

    if !def.auto_commit {
        error!(
            channel = def.name,
            attempts, "too many attempts, message will be dropped"
        );
    }

    DeliveryOutcome {
        attempts,
        handled: false,
    }
}
