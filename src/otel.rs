// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Propagates trace context through message headers and opens consumer spans
//! for inbound deliveries.

use crate::arguments::{Arguments, FieldValue};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::borrow::Cow;

/// Writes trace context entries into outbound message headers.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut Arguments,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut Arguments) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers
            .insert(key.to_lowercase(), FieldValue::String(value));
    }
}

/// Reads trace context entries from inbound message headers.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a Arguments,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a Arguments) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(FieldValue::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Creates a consumer span whose parent is the context carried by `headers`.
pub(crate) fn new_span(headers: &Arguments, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
