//! Span exporter contract and the finished-span representation.

use crate::trace::{
    Event, EvictedHashMap, EvictedQueue, Link, SpanContext, SpanId, SpanKind, Status, TraceError,
};
use crate::{InstrumentationScope, Resource};
use futures_util::future::BoxFuture;
use std::borrow::Cow;
use std::fmt::Debug;
use std::time::SystemTime;

/// Describes the result of an export.
pub type ExportResult = Result<(), TraceError>;

/// `SpanExporter` defines the interface that protocol-specific exporters
/// implement to be plugged into a span-processor pipeline.
///
/// The exporter is expected to be primarily a simple telemetry data encoder
/// and transmitter; batching, queuing, and retry policy live elsewhere.
pub trait SpanExporter: Send + Sync + Debug {
    /// Exports a batch of finished spans.
    ///
    /// This function is never called concurrently for the same exporter
    /// instance; the owning processor serializes calls and bounds them with
    /// its export deadline. A failed export is reported and the batch is
    /// discarded — the core never retries; retry logic, if desired, belongs
    /// to the exporter implementation.
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult>;

    /// Shuts down the exporter. Called once when the owning processor shuts
    /// down, after the final flush; subsequent `export` calls are not issued.
    fn shutdown(&mut self) {}
}

/// All the information collected by a finished span, as handed to exporters.
///
/// Exporters read this data but never mutate it.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanData {
    /// Exportable `SpanContext`.
    pub span_context: SpanContext,
    /// Id of the parent span, or [`SpanId::INVALID`] for root spans.
    pub parent_span_id: SpanId,
    /// Span kind.
    pub span_kind: SpanKind,
    /// Span name.
    pub name: Cow<'static, str>,
    /// Span start time.
    pub start_time: SystemTime,
    /// Span end time.
    pub end_time: SystemTime,
    /// Span attributes, bounded, in insertion order.
    pub attributes: EvictedHashMap,
    /// Span events, bounded, in recording order.
    pub events: EvictedQueue<Event>,
    /// Span links, bounded.
    pub links: EvictedQueue<Link>,
    /// Span status.
    pub status: Status,
    /// Labels describing the entity that produced this span.
    pub resource: Cow<'static, Resource>,
    /// The instrumented library this span was created through.
    pub instrumentation_scope: InstrumentationScope,
}
