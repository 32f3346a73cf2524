// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope and Publish Options
//!
//! Transport-neutral representation of what travels over the wire: an opaque
//! payload, string-keyed metadata headers and an optional record key.

use crate::errors::QueueError;
use serde::Serialize;
use std::collections::BTreeMap;

/// Header carrying the delay directive, in milliseconds
pub const X_DELAY_HEADER: &str = "x-delay";

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// String-keyed message metadata.
pub type Headers = BTreeMap<String, String>;

/// A message ready to leave, or just arrived in, the process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub key: Option<String>,
}

impl Envelope {
    /// Serializes `message` as JSON into a new envelope.
    pub fn json<T: Serialize + ?Sized>(message: &T) -> Result<Envelope, QueueError> {
        Ok(Envelope {
            payload: serde_json::to_vec(message)?,
            headers: Headers::default(),
            key: None,
        })
    }

    pub fn with_key(mut self, key: Option<String>) -> Self {
        self.key = key;
        self
    }

    /// Delay directive in milliseconds, if one is present and parses.
    pub fn delay(&self) -> Option<u64> {
        self.headers
            .get(X_DELAY_HEADER)
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
    }
}

/// Per-call publish options.
///
/// `name` selects the producer channel; `routing_key` picks the binding on
/// the exchange broker or the topic suffix on the log broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub name: String,
    pub routing_key: Option<String>,
    pub key: Option<String>,
    pub delay: Option<u64>,
    pub headers: Headers,
}

impl PublishOptions {
    pub fn new(name: &str) -> PublishOptions {
        PublishOptions {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn routing_key(mut self, routing_key: &str) -> Self {
        self.routing_key = Some(routing_key.to_owned());
        self
    }

    /// Sets the record key (message id) used for partitioning.
    pub fn key(mut self, key: &str) -> Self {
        self.key = Some(key.to_owned());
        self
    }

    /// Delays delivery by `ms` milliseconds.
    pub fn delay(mut self, ms: u64) -> Self {
        self.delay = Some(ms);
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }

    /// Caller headers merged with the delay directive.
    pub(crate) fn merged_headers(&self) -> Headers {
        let mut headers = self.headers.clone();
        if let Some(ms) = self.delay {
            headers.insert(X_DELAY_HEADER.to_owned(), ms.to_string());
        }
        headers
    }
}
