//! W3C trace-context propagator.

use crate::propagation::{Extractor, FieldIter, Injector, TextMapPropagator};
use crate::trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState};
use crate::Context;
use std::str::FromStr;
use std::sync::OnceLock;

const SUPPORTED_VERSION: u8 = 0;
const MAX_VERSION: u8 = 254;
const TRACEPARENT_HEADER: &str = "traceparent";
const TRACESTATE_HEADER: &str = "tracestate";

static TRACE_CONTEXT_HEADER_FIELDS: OnceLock<[String; 2]> = OnceLock::new();

fn trace_context_header_fields() -> &'static [String; 2] {
    TRACE_CONTEXT_HEADER_FIELDS
        .get_or_init(|| [TRACEPARENT_HEADER.to_owned(), TRACESTATE_HEADER.to_owned()])
}

/// Propagates span contexts in [W3C TraceContext] format under the
/// `traceparent` and `tracestate` headers.
///
/// The `traceparent` header identifies the request in a format understood by
/// all vendors:
///
/// `traceparent: 00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01`
///
/// with four fields: version, trace-id, parent-id (span id), and flags.
///
/// The `tracestate` header carries additional vendor-specific data:
///
/// `tracestate: vendorname1=opaqueValue1,vendorname2=opaqueValue2`
///
/// Unknown vendor entries are preserved verbatim in their original order —
/// samplers rewriting their own keys never clobber other vendors' entries.
/// Extraction is infallible: a malformed `traceparent` yields an invalid
/// span context (the caller then starts a fresh root), and a malformed
/// `tracestate` degrades to an empty state.
///
/// [W3C TraceContext]: https://www.w3.org/TR/trace-context/
#[derive(Clone, Debug, Default)]
pub struct TraceContextPropagator {
    _private: (),
}

impl TraceContextPropagator {
    /// Create a new propagator.
    pub fn new() -> Self {
        TraceContextPropagator { _private: () }
    }

    /// Extract a span context from the carrier's trace-context headers.
    fn extract_span_context(&self, extractor: &dyn Extractor) -> Result<SpanContext, ()> {
        let header_value = extractor.get(TRACEPARENT_HEADER).unwrap_or("").trim();
        let parts = header_value.split_terminator('-').collect::<Vec<&str>>();
        if parts.len() < 4 {
            return Err(());
        }

        // Version must be two lowercase hex digits below the reserved 255,
        // and version 0 has exactly four parts.
        if parts[0].len() != 2 || parts[0].chars().any(|c| c.is_ascii_uppercase()) {
            return Err(());
        }
        let version = u8::from_str_radix(parts[0], 16).map_err(|_| ())?;
        if version > MAX_VERSION || (version == 0 && parts.len() != 4) {
            return Err(());
        }

        // Ids must be lowercase hex of exactly the right length.
        if parts[1].chars().any(|c| c.is_ascii_uppercase()) {
            return Err(());
        }
        let trace_id = TraceId::from_hex(parts[1]).map_err(|_| ())?;

        if parts[2].chars().any(|c| c.is_ascii_uppercase()) {
            return Err(());
        }
        let span_id = SpanId::from_hex(parts[2]).map_err(|_| ())?;

        if parts[3].len() != 2 || parts[3].chars().any(|c| c.is_ascii_uppercase()) {
            return Err(());
        }
        let opts = u8::from_str_radix(parts[3], 16).map_err(|_| ())?;
        if version == 0 && opts > 2 {
            return Err(());
        }

        // Clear all flags other than the supported sampling bit.
        let trace_flags = TraceFlags::new(opts) & TraceFlags::SAMPLED;

        let trace_state = match extractor.get(TRACESTATE_HEADER) {
            Some(trace_state_str) => {
                TraceState::from_str(trace_state_str).unwrap_or_else(|_| TraceState::default())
            }
            None => TraceState::default(),
        };

        let span_context = SpanContext::new(trace_id, span_id, trace_flags, true, trace_state);

        if !span_context.is_valid() {
            return Err(());
        }

        Ok(span_context)
    }
}

impl TextMapPropagator for TraceContextPropagator {
    /// Encodes the context's span context into the carrier, if it is valid.
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        let span = cx.span();
        let span_context = span.span_context();
        if span_context.is_valid() {
            let header_value = format!(
                "{:02x}-{}-{}-{:02x}",
                SUPPORTED_VERSION,
                span_context.trace_id(),
                span_context.span_id(),
                span_context.trace_flags() & TraceFlags::SAMPLED
            );
            injector.set(TRACEPARENT_HEADER, header_value);
            injector.set(TRACESTATE_HEADER, span_context.trace_state().header());
        }
    }

    /// Decodes a span context from the carrier. If none is present, or the
    /// present one is invalid, the given context is returned unchanged.
    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        self.extract_span_context(extractor)
            .map(|sc| cx.with_remote_span_context(sc))
            .unwrap_or_else(|_| cx.clone())
    }

    fn fields(&self) -> FieldIter<'_> {
        FieldIter::new(trace_context_header_fields())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[rustfmt::skip]
    fn extract_data() -> Vec<(&'static str, &'static str, SpanContext)> {
        vec![
            ("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00", "foo=bar", SpanContext::new(TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736_u128), SpanId::from(0x00f0_67aa_0ba9_02b7_u64), TraceFlags::default(), true, TraceState::from_str("foo=bar").unwrap())),
            ("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01", "foo=bar", SpanContext::new(TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736_u128), SpanId::from(0x00f0_67aa_0ba9_02b7_u64), TraceFlags::SAMPLED, true, TraceState::from_str("foo=bar").unwrap())),
            ("02-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01", "foo=bar", SpanContext::new(TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736_u128), SpanId::from(0x00f0_67aa_0ba9_02b7_u64), TraceFlags::SAMPLED, true, TraceState::from_str("foo=bar").unwrap())),
            ("02-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-09", "foo=bar", SpanContext::new(TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736_u128), SpanId::from(0x00f0_67aa_0ba9_02b7_u64), TraceFlags::SAMPLED, true, TraceState::from_str("foo=bar").unwrap())),
            ("02-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-08", "foo=bar", SpanContext::new(TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736_u128), SpanId::from(0x00f0_67aa_0ba9_02b7_u64), TraceFlags::default(), true, TraceState::from_str("foo=bar").unwrap())),
            ("02-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-09-XYZxsf09", "foo=bar", SpanContext::new(TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736_u128), SpanId::from(0x00f0_67aa_0ba9_02b7_u64), TraceFlags::SAMPLED, true, TraceState::from_str("foo=bar").unwrap())),
            ("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-", "foo=bar", SpanContext::new(TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736_u128), SpanId::from(0x00f0_67aa_0ba9_02b7_u64), TraceFlags::SAMPLED, true, TraceState::from_str("foo=bar").unwrap())),
            ("01-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-09-", "foo=bar", SpanContext::new(TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736_u128), SpanId::from(0x00f0_67aa_0ba9_02b7_u64), TraceFlags::SAMPLED, true, TraceState::from_str("foo=bar").unwrap())),
        ]
    }

    #[rustfmt::skip]
    fn extract_data_invalid() -> Vec<(&'static str, &'static str)> {
        vec![
            ("0000-00000000000000000000000000000000-0000000000000000-01", "wrong version length"),
            ("00-ab00000000000000000000000000000000-cd00000000000000-01", "wrong trace ID length"),
            ("00-ab0000000000000000000000000000-cd00000000000000-01", "short trace ID"),
            ("00-ab000000000000000000000000000000-cd0000000000000000-01", "wrong span ID length"),
            ("00-ab000000000000000000000000000000-cd000000000000-01", "short span ID"),
            ("00-ab000000000000000000000000000000-cd00000000000000-0100", "wrong trace flag length"),
            ("qw-00000000000000000000000000000000-0000000000000000-01",   "bogus version"),
            ("00-qw000000000000000000000000000000-cd00000000000000-01",   "bogus trace ID"),
            ("00-ab000000000000000000000000000000-qw00000000000000-01",   "bogus span ID"),
            ("00-ab000000000000000000000000000000-cd00000000000000-qw",   "bogus trace flag"),
            ("A0-00000000000000000000000000000000-0000000000000000-01",   "upper case version"),
            ("00-AB000000000000000000000000000000-cd00000000000000-01",   "upper case trace ID"),
            ("00-ab000000000000000000000000000000-CD00000000000000-01",   "upper case span ID"),
            ("00-ab000000000000000000000000000000-cd00000000000000-A1",   "upper case trace flag"),
            ("00-00000000000000000000000000000000-0000000000000000-01",   "zero trace ID and span ID"),
            ("00-ab000000000000000000000000000000-cd00000000000000-09",   "trace-flag unused bits set"),
            ("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7",      "missing options"),
            ("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-",     "empty options"),
            ("", "completely empty"),
            ("   ", "whitespace only"),
            ("00", "too few parts"),
            ("00-", "incomplete with separator"),
            ("00--00", "missing trace ID"),
            ("00-4bf92f3577b34da6a3ce929d0e0e4736--01", "missing span ID"),
        ]
    }

    #[rustfmt::skip]
    fn inject_data() -> Vec<(&'static str, &'static str, SpanContext)> {
        vec![
            ("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01", "foo=bar", SpanContext::new(TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736_u128), SpanId::from(0x00f0_67aa_0ba9_02b7_u64), TraceFlags::SAMPLED, true, TraceState::from_str("foo=bar").unwrap())),
            ("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00", "foo=bar", SpanContext::new(TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736_u128), SpanId::from(0x00f0_67aa_0ba9_02b7_u64), TraceFlags::default(), true, TraceState::from_str("foo=bar").unwrap())),
            ("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01", "foo=bar", SpanContext::new(TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736_u128), SpanId::from(0x00f0_67aa_0ba9_02b7_u64), TraceFlags::new(0xff), true, TraceState::from_str("foo=bar").unwrap())),
            ("", "", SpanContext::empty_context()),
        ]
    }

    #[test]
    fn extract_w3c() {
        let propagator = TraceContextPropagator::new();

        for (trace_parent, trace_state, expected_context) in extract_data() {
            let mut extractor = HashMap::new();
            extractor.insert(TRACEPARENT_HEADER.to_string(), trace_parent.to_string());
            extractor.insert(TRACESTATE_HEADER.to_string(), trace_state.to_string());

            assert_eq!(
                propagator.extract(&extractor).span().span_context(),
                &expected_context,
                "failed to extract {trace_parent}"
            )
        }
    }

    #[test]
    fn extract_w3c_reject_invalid() {
        let propagator = TraceContextPropagator::new();

        for (invalid_header, reason) in extract_data_invalid() {
            let mut extractor = HashMap::new();
            extractor.insert(TRACEPARENT_HEADER.to_string(), invalid_header.to_string());

            assert_eq!(
                propagator.extract(&extractor).span().span_context(),
                &SpanContext::empty_context(),
                "{reason}"
            )
        }
    }

    #[test]
    fn extract_w3c_malformed_tracestate_keeps_valid_parent() {
        let propagator = TraceContextPropagator::new();
        let valid_parent = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

        for malformed_state in ["key=value,malformed", "=value", "🔥=🎉"] {
            let mut extractor = HashMap::new();
            extractor.insert(TRACEPARENT_HEADER.to_string(), valid_parent.to_string());
            extractor.insert(TRACESTATE_HEADER.to_string(), malformed_state.to_string());

            let cx = propagator.extract(&extractor);
            let span = cx.span();
            let span_context = span.span_context();
            assert!(
                span_context.is_valid(),
                "valid traceparent must survive malformed tracestate {malformed_state:?}"
            );
            assert_eq!(span_context.trace_state(), &TraceState::default());
        }
    }

    #[test]
    fn extract_preserves_foreign_tracestate_order() {
        let propagator = TraceContextPropagator::new();
        let mut extractor = HashMap::new();
        extractor.insert(
            TRACEPARENT_HEADER.to_string(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".to_string(),
        );
        extractor.insert(
            TRACESTATE_HEADER.to_string(),
            "congo=t61rcWkgMzE,rojo=00f067aa0ba902b7".to_string(),
        );

        let cx = propagator.extract(&extractor);
        let span = cx.span();
        let header = span.span_context().trace_state().header();
        assert_eq!(header, "congo=t61rcWkgMzE,rojo=00f067aa0ba902b7");
    }

    #[test]
    fn inject_w3c() {
        let propagator = TraceContextPropagator::new();

        for (expected_trace_parent, expected_trace_state, span_context) in inject_data() {
            let mut injector = HashMap::new();
            propagator.inject_context(
                &Context::new().with_remote_span_context(span_context),
                &mut injector,
            );

            assert_eq!(
                Extractor::get(&injector, TRACEPARENT_HEADER).unwrap_or(""),
                expected_trace_parent
            );

            assert_eq!(
                Extractor::get(&injector, TRACESTATE_HEADER).unwrap_or(""),
                expected_trace_state
            );
        }
    }

    #[test]
    fn decode_encode_round_trips_to_identical_header() {
        let propagator = TraceContextPropagator::new();

        for header in [
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
        ] {
            let mut extractor = HashMap::new();
            extractor.insert(TRACEPARENT_HEADER.to_string(), header.to_string());

            let cx = propagator.extract(&extractor);
            let mut injector = HashMap::new();
            propagator.inject_context(&cx, &mut injector);

            assert_eq!(Extractor::get(&injector, TRACEPARENT_HEADER), Some(header));
        }
    }

    #[test]
    fn extract_is_memory_safe_for_huge_headers() {
        let propagator = TraceContextPropagator::new();

        let huge = format!("00-{}-{}-01", "a".repeat(1_000_000), "b".repeat(1_000_000));
        let mut extractor = HashMap::new();
        extractor.insert(TRACEPARENT_HEADER.to_string(), huge);

        let cx = propagator.extract(&extractor);
        assert_eq!(cx.span().span_context(), &SpanContext::empty_context());
    }
}
