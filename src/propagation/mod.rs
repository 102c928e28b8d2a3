//! Wire-level context propagation.
//!
//! Propagators read and write span context to and from the messages
//! exchanged between applications, using [`Injector`] and [`Extractor`] to
//! stay carrier-agnostic (HTTP headers, message metadata, any string map).
//!
//! The crate ships [`TraceContextPropagator`], the W3C `traceparent`/
//! `tracestate` text format.

use crate::Context;
use std::collections::HashMap;
use std::fmt;
use std::slice;

mod trace_context;

pub use trace_context::TraceContextPropagator;

/// Injector provides an interface for adding fields to an underlying
/// carrier, such as an outgoing request's headers.
pub trait Injector {
    /// Add a key and value to the carrier.
    fn set(&mut self, key: &str, value: String);
}

/// Extractor provides an interface for reading fields from an underlying
/// carrier, such as an incoming request's headers.
pub trait Extractor {
    /// Get a value for a key from the carrier.
    fn get(&self, key: &str) -> Option<&str>;

    /// Collect all the keys from the carrier.
    fn keys(&self) -> Vec<&str>;
}

impl<S: std::hash::BuildHasher> Injector for HashMap<String, String, S> {
    /// Set a key and value in the HashMap.
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), value);
    }
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, String, S> {
    /// Get a value for a key from the HashMap.
    fn get(&self, key: &str) -> Option<&str> {
        self.get(&key.to_lowercase()).map(|v| v.as_str())
    }

    /// Collect all the keys from the HashMap.
    fn keys(&self) -> Vec<&str> {
        self.keys().map(|k| k.as_str()).collect::<Vec<_>>()
    }
}

/// Encodes and decodes a [`Context`]'s span context to and from a carrier.
///
/// `extract` never fails: malformed carrier data yields the unchanged
/// context, so broken telemetry headers can never break request handling.
pub trait TextMapPropagator: fmt::Debug {
    /// Encode the span context of `cx` into the carrier.
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector);

    /// Encode the current context's span context into the carrier.
    fn inject(&self, injector: &mut dyn Injector) {
        Context::map_current(|cx| self.inject_context(cx, injector))
    }

    /// Decode a span context from the carrier on top of the given context.
    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context;

    /// Decode a span context from the carrier on top of the current context.
    fn extract(&self, extractor: &dyn Extractor) -> Context {
        Context::map_current(|cx| self.extract_with_context(cx, extractor))
    }

    /// The carrier fields this propagator reads and writes, for carriers
    /// that need to pre-declare them.
    fn fields(&self) -> FieldIter<'_>;
}

/// An iterator over the fields a propagator uses.
#[derive(Debug)]
pub struct FieldIter<'a>(slice::Iter<'a, String>);

impl<'a> FieldIter<'a> {
    /// Create a new `FieldIter` from a slice of field names.
    pub fn new(fields: &'a [String]) -> Self {
        FieldIter(fields.iter())
    }
}

impl<'a> Iterator for FieldIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|field| field.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_map_carrier_is_case_insensitive() {
        let mut carrier = HashMap::new();
        Injector::set(&mut carrier, "HeaderName", "value".to_string());

        assert_eq!(
            Extractor::get(&carrier, "HEADERNAME"),
            Some("value"),
            "case insensitive extraction"
        );
        assert_eq!(Extractor::keys(&carrier), vec!["headername"]);
    }
}
