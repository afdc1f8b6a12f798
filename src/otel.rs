// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! This module propagates trace context through message headers. Published
//! messages carry the publisher's context; each delivery gets a consumer span
//! whose parent is the context found in its headers.

use crate::delivery::Delivery;
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};

/// An adapter for injecting and extracting OpenTelemetry context from
/// message headers.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut BTreeMap<String, String>,
}

impl<'a> HeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    /// Sets a trace context key-value pair in the message headers.
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

impl Extractor for HeaderPropagator<'_> {
    /// Gets a trace context value from the message headers.
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|value| value.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Writes the given context into the headers with the global propagator.
pub(crate) fn inject(ctx: &Context, headers: &mut BTreeMap<String, String>) {
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderPropagator::new(headers))
    });
}

/// Creates a consumer span for a delivery.
///
/// The parent context is extracted from the delivery headers, and the span is
/// named after the routing key.
///
/// # Returns
/// A tuple containing the extracted context and the new span
pub(crate) fn new_span(delivery: &Delivery, tracer: &BoxedTracer) -> (Context, BoxedSpan) {
    let mut headers = delivery.headers.clone();
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderPropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(delivery.routing_key.clone()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
