// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! This module propagates trace context through message headers. Producers
//! inject the context of a producer span before the payload leaves the
//! process; consumers extract it and parent a consumer span on it. Both
//! transports carry the same string-keyed headers, so one adapter serves both.

use crate::message::Headers;
use opentelemetry::{
    global,
    propagation::{Extractor, Injector},
    trace::{SpanKind, TraceContextExt, Tracer},
    Context, KeyValue,
};
use std::borrow::Cow;

/// Name of the tracer used by the queue services
pub const TRACER_NAME: &str = "queue-bridge";

pub const MESSAGING_SYSTEM: &str = "messaging.system";
pub const MESSAGING_DESTINATION: &str = "messaging.destination.name";
pub const MESSAGING_OPERATION: &str = "messaging.operation";

/// An adapter for injecting and extracting OpenTelemetry context from message
/// headers.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

impl Extractor for HeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Read-only view used on the consume path, so received headers are never
/// touched.
struct HeaderExtractor<'a>(&'a Headers);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Starts a producer span for `destination` and injects its context into
/// `headers`.
///
/// The returned context holds the span; end it with `cx.span().end()` once
/// the send completes.
pub fn start_producer_span<T>(
    tracer: &T,
    system: &str,
    destination: &str,
    headers: &mut Headers,
) -> Context
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
{
    let span = tracer
        .span_builder(Cow::from(destination.to_owned()))
        .with_kind(SpanKind::Producer)
        .with_attributes(vec![
            KeyValue::new(MESSAGING_SYSTEM, system.to_owned()),
            KeyValue::new(MESSAGING_DESTINATION, destination.to_owned()),
        ])
        .start_with_context(tracer, &Context::current());

    let cx = Context::current_with_span(span);

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&cx, &mut HeaderPropagator::new(headers))
    });

    cx
}

/// Starts a consumer span for a received message.
///
/// If `headers` carry a valid remote context the span is parented on it,
/// otherwise it starts a new trace. The returned context holds the span.
pub fn start_consumer_span<T>(
    tracer: &T,
    system: &str,
    destination: &str,
    headers: &Headers,
) -> Context
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
{
    let extracted = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(headers))
    });

    let parent = if extracted.span().span_context().is_valid() {
        extracted
    } else {
        Context::new()
    };

    let span = tracer
        .span_builder(Cow::from(destination.to_owned()))
        .with_kind(SpanKind::Consumer)
        .with_attributes(vec![
            KeyValue::new(MESSAGING_SYSTEM, system.to_owned()),
            KeyValue::new(MESSAGING_DESTINATION, destination.to_owned()),
            KeyValue::new(MESSAGING_OPERATION, "receive"),
        ])
        .start_with_context(tracer, &parent);

    parent.with_span(span)
}
