// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Trace Context over AMQP Headers
//!
//! Publishers inject the current OpenTelemetry context into the header table of
//! every message; consumers extract it again to parent the span that covers
//! the handler call.

use lapin::types::{AMQPValue, FieldTable, ShortString};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::collections::BTreeMap;
use tracing::warn;

/// Writes propagation fields into an outgoing header table. Keys are
/// lowercased so extraction does not depend on the propagator's casing.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers
            .insert(ShortString::from(key.to_lowercase()), AMQPValue::LongString(value.into()));
    }
}

/// Read-only view over the headers of a delivery. Only long-string values
/// holding valid UTF-8 are visible.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<ShortString, AMQPValue>,
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.headers.get(key)? {
            AMQPValue::LongString(value) => match std::str::from_utf8(value.as_bytes()) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(header = key, error = err.to_string(), "undecodable trace header");
                    None
                }
            },
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(ShortString::as_str).collect()
    }
}

/// Starts a consumer span for a delivery, parented on the context propagated
/// in its headers. Returns the extracted context alongside the span.
pub fn new_span(headers: &FieldTable, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let parent = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor {
            headers: headers.inner(),
        })
    });

    let span = tracer
        .span_builder(name.to_owned())
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &parent);

    (parent, span)
}
