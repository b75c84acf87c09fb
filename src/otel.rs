// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Propagation over AMQP Headers
//!
//! Outgoing publishes inject the current context into the message headers;
//! consumed deliveries extract it and open a consumer span.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::warn;

/// Text-map carrier over AMQP headers. Keys are stored lowercased.
pub(crate) struct HeaderCarrier<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderCarrier<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        HeaderCarrier { headers }
    }
}

impl Injector for HeaderCarrier<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            ShortString::from(key.to_ascii_lowercase()),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for HeaderCarrier<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        let AMQPValue::LongString(raw) = self.headers.get(key)? else {
            return None;
        };

        match std::str::from_utf8(raw.as_bytes()) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = err.to_string(), "trace header is not utf-8");
                None
            }
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(ShortString::as_str).collect()
    }
}

/// Context carried by `props`, or an empty one.
pub(crate) fn extract_context(props: &AMQPProperties) -> Context {
    let mut headers = props
        .headers()
        .as_ref()
        .map(FieldTable::inner)
        .cloned()
        .unwrap_or_default();

    global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderCarrier::new(&mut headers))
    })
}

/// Starts a consumer span named `name` under the producer's context.
pub(crate) fn consumer_span(props: &AMQPProperties, tracer: &BoxedTracer, name: &str) -> BoxedSpan {
    tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &extract_context(props))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::{types::LongString, BasicProperties};

    #[test]
    fn injected_keys_are_lowercased_and_readable() {
        let mut headers = BTreeMap::new();
        let mut carrier = HeaderCarrier::new(&mut headers);

        carrier.set("TraceParent", "00-abc-def-01".to_owned());

        assert_eq!(carrier.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(carrier.keys(), vec!["traceparent"]);
    }

    #[test]
    fn non_text_headers_are_ignored() {
        let mut headers = BTreeMap::new();
        headers.insert(ShortString::from("count"), AMQPValue::LongLongInt(3));
        headers.insert(
            ShortString::from("tag"),
            AMQPValue::LongString(LongString::from("billing")),
        );
        let carrier = HeaderCarrier::new(&mut headers);

        assert_eq!(carrier.get("count"), None);
        assert_eq!(carrier.get("tag"), Some("billing"));
        assert_eq!(carrier.get("missing"), None);
    }

    #[test]
    fn properties_without_headers_give_an_empty_context() {
        use opentelemetry::trace::TraceContextExt;

        let ctx = extract_context(&BasicProperties::default());

        assert!(!ctx.span().span_context().is_valid());
    }
}
