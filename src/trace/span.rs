//! A span is a single operation within a trace.
//!
//! Spans can be nested to form a trace tree. A span's start and end
//! timestamps reflect the elapsed real time of the operation; between the
//! two, attributes, events, and links may be recorded. After the end time
//! has been set the span is immutable: further mutation is a no-op, never an
//! error.

use crate::trace::span_limit::SpanLimits;
use crate::trace::{
    Event, EvictedHashMap, EvictedQueue, Link, SpanContext, SpanData, SpanId, SpanKind, Status,
    Tracer,
};
use crate::KeyValue;
use std::borrow::Cow;
use std::time::SystemTime;

/// Single operation within a trace.
///
/// Ending is idempotent: only the first `end` call (or the implicit end on
/// drop) reports the span to the registered processors.
#[derive(Debug)]
pub struct Span {
    span_context: SpanContext,
    // `None` when the span is not recording, or has already ended.
    inner: Option<SpanInner>,
    tracer: Tracer,
    span_limits: SpanLimits,
}

/// Mutable state owned by a recording span.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SpanInner {
    pub(crate) parent_span_id: SpanId,
    pub(crate) span_kind: SpanKind,
    pub(crate) name: Cow<'static, str>,
    pub(crate) start_time: SystemTime,
    pub(crate) end_time: SystemTime,
    pub(crate) attributes: EvictedHashMap,
    pub(crate) events: EvictedQueue<Event>,
    pub(crate) links: EvictedQueue<Link>,
    pub(crate) status: Status,
}

impl Span {
    pub(crate) fn new(
        span_context: SpanContext,
        inner: Option<SpanInner>,
        tracer: Tracer,
        span_limits: SpanLimits,
    ) -> Self {
        Span {
            span_context,
            inner,
            tracer,
            span_limits,
        }
    }

    /// The immutable, propagatable part of this span.
    pub fn span_context(&self) -> &SpanContext {
        &self.span_context
    }

    /// Returns `true` while this span records information. Always `false`
    /// after `end`.
    pub fn is_recording(&self) -> bool {
        self.inner.is_some()
    }

    /// Set a single attribute on this span.
    ///
    /// Writing an existing key overwrites its value; once the configured
    /// attribute cap is reached the oldest attribute is evicted.
    pub fn set_attribute(&mut self, attribute: KeyValue) {
        self.with_inner(|inner| inner.attributes.insert(attribute));
    }

    /// Set multiple attributes on this span.
    pub fn set_attributes(&mut self, attributes: impl IntoIterator<Item = KeyValue>) {
        self.with_inner(|inner| inner.attributes.extend(attributes));
    }

    /// Record an event on this span, timestamped now.
    pub fn add_event<T>(&mut self, name: T, attributes: Vec<KeyValue>)
    where
        T: Into<Cow<'static, str>>,
    {
        self.add_event_with_timestamp(name, SystemTime::now(), attributes)
    }

    /// Record an event on this span with an explicit timestamp.
    pub fn add_event_with_timestamp<T>(
        &mut self,
        name: T,
        timestamp: SystemTime,
        mut attributes: Vec<KeyValue>,
    ) where
        T: Into<Cow<'static, str>>,
    {
        let event_attributes_limit = self.span_limits.max_attributes_per_event as usize;
        let name = name.into();
        self.with_inner(|inner| {
            let dropped_attributes_count =
                attributes.len().saturating_sub(event_attributes_limit);
            attributes.truncate(event_attributes_limit);
            inner.events.push_back(Event::new(
                name,
                timestamp,
                attributes,
                dropped_attributes_count as u32,
            ));
        });
    }

    /// Record an error as an event on this span.
    ///
    /// The span status is not changed; use [`Span::set_status`] as well if
    /// the operation failed.
    pub fn record_error(&mut self, err: &dyn std::error::Error) {
        let attributes = vec![KeyValue::new("exception.message", err.to_string())];
        self.add_event("exception", attributes);
    }

    /// Add a link to another span.
    pub fn add_link(&mut self, span_context: SpanContext, mut attributes: Vec<KeyValue>) {
        let link_attributes_limit = self.span_limits.max_attributes_per_link as usize;
        self.with_inner(|inner| {
            let dropped_attributes_count = attributes.len().saturating_sub(link_attributes_limit);
            attributes.truncate(link_attributes_limit);
            inner.links.push_back(Link {
                span_context,
                attributes,
                dropped_attributes_count: dropped_attributes_count as u32,
            });
        });
    }

    /// Set the status of this span.
    ///
    /// Statuses form a total order `Ok > Error > Unset`; a write with a
    /// lower status than the current one is ignored.
    pub fn set_status(&mut self, status: Status) {
        self.with_inner(|inner| {
            if status > inner.status {
                inner.status = status;
            }
        });
    }

    /// Update the span's name.
    pub fn update_name<T>(&mut self, new_name: T)
    where
        T: Into<Cow<'static, str>>,
    {
        let new_name = new_name.into();
        self.with_inner(|inner| inner.name = new_name);
    }

    /// End the span now.
    pub fn end(&mut self) {
        self.ensure_ended_and_reported(Some(SystemTime::now()));
    }

    /// End the span at the given timestamp.
    pub fn end_with_timestamp(&mut self, timestamp: SystemTime) {
        self.ensure_ended_and_reported(Some(timestamp));
    }

    /// Convert the information in this span into an exportable [`SpanData`].
    ///
    /// Returns `None` for non-recording or ended spans.
    pub fn exported_data(&self) -> Option<SpanData> {
        self.inner
            .as_ref()
            .map(|inner| build_export_data(inner.clone(), self.span_context.clone(), &self.tracer))
    }

    fn with_inner<T, F>(&mut self, f: F) -> Option<T>
    where
        F: FnOnce(&mut SpanInner) -> T,
    {
        self.inner.as_mut().map(f)
    }

    fn ensure_ended_and_reported(&mut self, timestamp: Option<SystemTime>) {
        // Take the inner state; a second end (or end-after-drop) finds
        // nothing to report.
        let mut inner = match self.inner.take() {
            Some(inner) => inner,
            None => return,
        };

        let provider = self.tracer.provider();
        if provider.is_shutdown() {
            return;
        }

        // End time is set by the explicit call, or implicitly on drop.
        if let Some(timestamp) = timestamp {
            inner.end_time = timestamp;
        } else if inner.end_time == inner.start_time {
            inner.end_time = SystemTime::now();
        }

        match provider.span_processors() {
            [] => {}
            [processor] => {
                processor.on_end(build_export_data(
                    inner,
                    self.span_context.clone(),
                    &self.tracer,
                ));
            }
            processors => {
                for processor in processors {
                    processor.on_end(build_export_data(
                        inner.clone(),
                        self.span_context.clone(),
                        &self.tracer,
                    ));
                }
            }
        }
    }
}

impl Drop for Span {
    /// Report the span on drop if it was not explicitly ended.
    fn drop(&mut self) {
        self.ensure_ended_and_reported(None);
    }
}

fn build_export_data(inner: SpanInner, span_context: SpanContext, tracer: &Tracer) -> SpanData {
    SpanData {
        span_context,
        parent_span_id: inner.parent_span_id,
        span_kind: inner.span_kind,
        name: inner.name,
        start_time: inner.start_time,
        end_time: inner.end_time,
        attributes: inner.attributes,
        events: inner.events,
        links: inner.links,
        status: inner.status,
        resource: tracer.provider().config().resource.clone(),
        instrumentation_scope: tracer.instrumentation_scope().clone(),
    }
}
