//! Tracing core: span identity, lifecycle, sampling, and processing.
//!
//! The tracing pipeline consists of a few main structs:
//!
//! * The [`Tracer`] which creates spans via [`SpanBuilder`].
//! * The [`Span`], a mutable record of one operation, reported to the
//!   registered [`SpanProcessor`]s when it starts and ends.
//! * The [`TracerProvider`] which configures samplers, processors, and
//!   resource labels and hands out memoized [`Tracer`] instances.
//!
//! Sampling decisions are made by [`ShouldSample`] implementations, from the
//! trivial [`Sampler`] constants to trust-boundary-aware compositions like
//! [`BoundarySampler`]. Span contexts cross process boundaries through the
//! [`crate::propagation`] module.

use crate::KeyValue;
use std::borrow::Cow;
use std::time::{Duration, SystemTime};
use thiserror::Error;

pub(crate) mod context;
mod evicted_hash_map;
mod evicted_queue;
mod export;
mod id_generator;
mod in_memory_exporter;
mod sampler;
mod span;
mod span_context;
mod span_limit;
mod span_processor;
mod tracer;

mod config;
mod provider;

pub use config::Config;
pub use context::{get_active_span, mark_span_as_active, SpanRef, TraceContextExt};
pub use evicted_hash_map::EvictedHashMap;
pub use evicted_queue::EvictedQueue;
pub use export::{ExportResult, SpanData, SpanExporter};
pub use id_generator::{IdGenerator, IncrementIdGenerator, RandomIdGenerator};
pub use in_memory_exporter::InMemorySpanExporter;
pub use sampler::{
    BoundarySampler, ExternalCallScope, PublicBoundary, Sampler, SamplingDecision,
    SamplingParameters, SamplingResult, ScoreGenerator, ScoreSampler, ShouldSample,
    ThirdPartyParentSampler, RESOURCE_ID_ATTRIBUTE, SAMPLING_SCORE_KEY,
    THIRD_PARTY_ONLY_ATTRIBUTE,
};
pub use span::Span;
pub use span_context::{IdFormatError, SpanContext, SpanId, TraceFlags, TraceId, TraceState};
pub use span_limit::SpanLimits;
pub use span_processor::{
    BatchConfig, BatchConfigBuilder, BatchSpanProcessor, BatchSpanProcessorBuilder,
    MultiSpanProcessor, SimpleSpanProcessor, SpanProcessor,
};
pub use tracer::{ParentSource, SpanBuilder, Tracer};

pub use provider::{TracerProvider, TracerProviderBuilder};

/// Describes the result of operations in the tracing API.
pub type TraceResult<T> = Result<T, TraceError>;

/// Errors returned by the tracing API.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TraceError {
    /// A trace or span id string failed to parse.
    #[error(transparent)]
    IdFormat(#[from] IdFormatError),

    /// Export failed with the error reported by the exporter.
    #[error("export failed: {0}")]
    ExportFailed(String),

    /// Export, flush, or shutdown did not finish within its deadline.
    #[error("operation timed out after {} ms", .0.as_millis())]
    ExportTimedOut(Duration),

    /// The component was already shut down; only the first call has effect.
    #[error("already shut down")]
    AlreadyShutdown,

    /// Other failures not covered by the variants above.
    #[error("{0}")]
    Other(String),
}

impl From<String> for TraceError {
    fn from(msg: String) -> Self {
        TraceError::Other(msg)
    }
}

impl From<&'static str> for TraceError {
    fn from(msg: &'static str) -> Self {
        TraceError::Other(msg.to_string())
    }
}

/// The kind of operation a span describes, relative to its trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpanKind {
    /// Outgoing synchronous remote call, e.g. an HTTP request issued by this
    /// process.
    Client,
    /// Incoming synchronous remote call being handled by this process.
    Server,
    /// Message sent to a broker; the consumer may pick it up much later.
    Producer,
    /// Message received from a broker.
    Consumer,
    /// Operation internal to the process.
    Internal,
}

/// The status of a completed span.
///
/// These values form a total order: `Ok > Error > Unset`, so `set_status`
/// upgrades only.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    /// The default status.
    #[default]
    Unset,
    /// The operation contains an error.
    Error {
        /// The description of the error.
        description: Cow<'static, str>,
    },
    /// The operation has been validated to have completed successfully.
    Ok,
}

impl Status {
    /// Create an error status with the given description.
    pub fn error(description: impl Into<Cow<'static, str>>) -> Self {
        Status::Error {
            description: description.into(),
        }
    }
}

/// A point-in-time annotation on a span.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// The name of this event.
    pub name: Cow<'static, str>,
    /// The time at which this event occurred.
    pub timestamp: SystemTime,
    /// Attributes describing this event.
    pub attributes: Vec<KeyValue>,
    /// The number of attributes dropped from this event due to limits.
    pub dropped_attributes_count: u32,
}

impl Event {
    /// Create a new event.
    pub fn new<T: Into<Cow<'static, str>>>(
        name: T,
        timestamp: SystemTime,
        attributes: Vec<KeyValue>,
        dropped_attributes_count: u32,
    ) -> Self {
        Event {
            name: name.into(),
            timestamp,
            attributes,
            dropped_attributes_count,
        }
    }

    /// Create a new event with a name and no attributes, timestamped now.
    pub fn with_name<T: Into<Cow<'static, str>>>(name: T) -> Self {
        Event {
            name: name.into(),
            timestamp: SystemTime::now(),
            attributes: Vec::new(),
            dropped_attributes_count: 0,
        }
    }
}

/// A causal (not parent/child) relationship to a span, possibly in another
/// trace, e.g. a message consumer linking to the producer span.
#[derive(Clone, Debug, PartialEq)]
pub struct Link {
    /// The span context of the linked span.
    pub span_context: SpanContext,
    /// Attributes describing this link.
    pub attributes: Vec<KeyValue>,
    /// The number of attributes dropped from this link due to limits.
    pub dropped_attributes_count: u32,
}

impl Link {
    /// Create a new link to the given span context.
    pub fn new(span_context: SpanContext, attributes: Vec<KeyValue>) -> Self {
        Link {
            span_context,
            attributes,
            dropped_attributes_count: 0,
        }
    }
}
