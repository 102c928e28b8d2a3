//! Distributed tracing SDK core.
//!
//! `traceline` creates, propagates, samples, and exports *spans* — timed
//! records of an operation with causal links to other spans across process
//! boundaries. It is the substrate instrumentation libraries (HTTP servers
//! and clients, database drivers) and vendor exporters plug into.
//!
//! The crate is organized around four subsystems:
//!
//! * **Identity & context** — [`trace::TraceId`], [`trace::SpanId`],
//!   [`trace::SpanContext`], and [`trace::TraceState`]: immutable value
//!   types safe to share across threads.
//! * **Sampling** — [`trace::ShouldSample`] strategies from the trivial
//!   constants to score-based ([`trace::ScoreSampler`]) and
//!   trust-boundary-aware ([`trace::BoundarySampler`],
//!   [`trace::ThirdPartyParentSampler`]) compositions.
//! * **Processing** — [`trace::SpanProcessor`] implementations that buffer,
//!   batch, and asynchronously flush finished spans with bounded resources.
//! * **Propagation** — the W3C `traceparent`/`tracestate` codec in
//!   [`propagation`], round-tripping foreign vendor data untouched.
//!
//! # Getting started
//!
//! ```
//! use traceline::trace::{InMemorySpanExporter, TracerProvider};
//!
//! // Assemble a pipeline: sampler + processors + resource.
//! let exporter = InMemorySpanExporter::default();
//! let provider = TracerProvider::builder()
//!     .with_simple_exporter(exporter.clone())
//!     .build();
//!
//! // One tracer per instrumented library.
//! let tracer = provider.tracer("app");
//!
//! tracer.in_span("handle-request", |_cx| {
//!     // spans created here are children of handle-request
//! });
//!
//! provider.shutdown().unwrap();
//! ```
//!
//! Tracing must never be the reason an application fails: malformed wire
//! data decodes to an invalid context, sampler and exporter failures degrade
//! to safe defaults, full queues drop spans without blocking producers, and
//! mutating an ended span is a no-op.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

mod common;
mod context;
mod resource;

pub mod propagation;
pub mod trace;

pub use common::{Array, InstrumentationScope, Key, KeyValue, StringValue, Value};
pub use context::{Context, ContextGuard};
pub use resource::{Resource, ResourceBuilder, SERVICE_NAME};
