// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Propagates trace context through message headers. Outgoing messages carry
//! the caller's current context; each consumed delivery opens a consumer span
//! whose parent is the context extracted from its headers.

use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};

/// Instrumentation scope of the spans opened by this crate.
pub(crate) const TRACER_NAME: &str = "rabbitmq-wrapper";

/// Writes trace context entries into outgoing message headers.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut BTreeMap<String, String>,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

/// Reads trace context entries from incoming message headers.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<String, String>,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Headers carrying the current trace context.
pub(crate) fn current_context_headers() -> BTreeMap<String, String> {
    let mut headers = BTreeMap::default();
    let ctx = Context::current();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut HeaderInjector::new(&mut headers))
    });

    headers
}

pub(crate) fn tracer() -> BoxedTracer {
    global::tracer(TRACER_NAME)
}

/// Creates a consumer span for one delivery.
///
/// The span's parent is the context extracted from `headers`; with no
/// propagator installed, the span is a root span.
pub fn new_span(headers: &BTreeMap<String, String>, tracer: &BoxedTracer, name: &str) -> BoxedSpan {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(headers))
    });

    tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_keys_are_lowercased() {
        let mut headers = BTreeMap::default();
        HeaderInjector::new(&mut headers).set("X-Trace", "abc".to_owned());

        assert_eq!(headers.get("x-trace").map(String::as_str), Some("abc"));
    }

    #[test]
    fn extractor_reads_string_headers() {
        let headers = BTreeMap::from([("traceparent".to_owned(), "00-abc".to_owned())]);
        let extractor = HeaderExtractor::new(&headers);

        assert_eq!(extractor.get("traceparent"), Some("00-abc"));
        assert_eq!(extractor.get("missing"), None);
        assert_eq!(extractor.keys(), vec!["traceparent"]);
    }

    #[test]
    fn no_propagator_means_no_headers() {
        assert!(current_context_headers().is_empty());
    }
}
