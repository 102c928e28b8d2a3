//! Context extensions for tracing: associating spans with the ambient scope.

use crate::trace::{Span, SpanContext, Status};
use crate::{Context, ContextGuard, KeyValue};
use std::borrow::Cow;
use std::sync::Mutex;
use std::time::SystemTime;

const NOOP_SPAN: SynchronizedSpan = SynchronizedSpan {
    span_context: SpanContext::NONE,
    inner: None,
};

/// A span carried by a [`Context`].
///
/// The span context is kept outside the lock so reads of the immutable part
/// never contend with mutations.
#[derive(Debug)]
pub(crate) struct SynchronizedSpan {
    span_context: SpanContext,
    inner: Option<Mutex<Span>>,
}

impl SynchronizedSpan {
    pub(crate) fn span_context(&self) -> &SpanContext {
        &self.span_context
    }
}

impl From<SpanContext> for SynchronizedSpan {
    fn from(value: SpanContext) -> Self {
        Self {
            span_context: value,
            inner: None,
        }
    }
}

impl From<Span> for SynchronizedSpan {
    fn from(value: Span) -> Self {
        Self {
            span_context: value.span_context().clone(),
            inner: Some(Mutex::new(value)),
        }
    }
}

/// A reference to the active span in a context.
///
/// For contexts carrying only a propagated [`SpanContext`] (no live span),
/// the mutating methods are no-ops.
#[derive(Debug)]
pub struct SpanRef<'a>(&'a SynchronizedSpan);

impl<'a> SpanRef<'a> {
    fn with_inner_mut<F: FnOnce(&mut Span)>(&self, f: F) {
        if let Some(inner) = &self.0.inner {
            match inner.lock() {
                Ok(mut locked) => f(&mut locked),
                Err(err) => tracing::warn!(error = %err, "active span lock poisoned"),
            }
        }
    }

    /// A reference to the [`SpanContext`] for this span.
    pub fn span_context(&self) -> &'a SpanContext {
        &self.0.span_context
    }

    /// Returns `true` if this span is recording information.
    pub fn is_recording(&self) -> bool {
        self.0
            .inner
            .as_ref()
            .and_then(|inner| inner.lock().ok().map(|active| active.is_recording()))
            .unwrap_or(false)
    }

    /// Record an event on this span, timestamped now.
    pub fn add_event<T>(&self, name: T, attributes: Vec<KeyValue>)
    where
        T: Into<Cow<'static, str>>,
    {
        self.with_inner_mut(|inner| inner.add_event(name, attributes))
    }

    /// Record an event on this span with the given timestamp.
    pub fn add_event_with_timestamp<T>(
        &self,
        name: T,
        timestamp: SystemTime,
        attributes: Vec<KeyValue>,
    ) where
        T: Into<Cow<'static, str>>,
    {
        self.with_inner_mut(move |inner| inner.add_event_with_timestamp(name, timestamp, attributes))
    }

    /// Record an error as an event on this span.
    pub fn record_error(&self, err: &dyn std::error::Error) {
        self.with_inner_mut(|inner| inner.record_error(err))
    }

    /// Set an attribute on this span.
    pub fn set_attribute(&self, attribute: KeyValue) {
        self.with_inner_mut(move |inner| inner.set_attribute(attribute))
    }

    /// Set multiple attributes on this span.
    pub fn set_attributes(&self, attributes: impl IntoIterator<Item = KeyValue>) {
        let attributes = attributes.into_iter().collect::<Vec<_>>();
        self.with_inner_mut(move |inner| inner.set_attributes(attributes))
    }

    /// Set the status of this span.
    pub fn set_status(&self, status: Status) {
        self.with_inner_mut(move |inner| inner.set_status(status))
    }

    /// Update the span's name.
    pub fn update_name<T>(&self, new_name: T)
    where
        T: Into<Cow<'static, str>>,
    {
        self.with_inner_mut(move |inner| inner.update_name(new_name))
    }

    /// Add a link to the span.
    pub fn add_link(&self, span_context: SpanContext, attributes: Vec<KeyValue>) {
        self.with_inner_mut(move |inner| inner.add_link(span_context, attributes))
    }

    /// Signal that the operation described by this span has now ended.
    pub fn end(&self) {
        self.end_with_timestamp(SystemTime::now());
    }

    /// Signal that the operation described by this span ended at the given
    /// time.
    pub fn end_with_timestamp(&self, timestamp: SystemTime) {
        self.with_inner_mut(move |inner| inner.end_with_timestamp(timestamp))
    }
}

/// Methods for storing and retrieving trace data in a [`Context`].
pub trait TraceContextExt {
    /// Returns a clone of the current context with the included span.
    ///
    /// # Examples
    ///
    /// ```
    /// use traceline::trace::{TraceContextExt, TracerProvider};
    /// use traceline::Context;
    ///
    /// let provider = TracerProvider::default();
    /// let tracer = provider.tracer("example");
    ///
    /// let span = tracer.start("parent_span");
    /// let cx = Context::current_with_span(span);
    ///
    /// // create a child span by explicitly specifying the parent context
    /// let child = tracer.start_with_context("child_span", &cx);
    /// # drop(child);
    /// ```
    fn current_with_span(span: Span) -> Self;

    /// Returns a clone of this context with the included span.
    fn with_span(&self, span: Span) -> Self;

    /// Returns a reference to this context's span, or a no-op reference if
    /// none is set.
    fn span(&self) -> SpanRef<'_>;

    /// Returns whether a span has been associated with this context.
    fn has_active_span(&self) -> bool;

    /// Returns a copy of this context with the span context included.
    ///
    /// This is useful for building propagators.
    fn with_remote_span_context(&self, span_context: SpanContext) -> Self;
}

impl TraceContextExt for Context {
    fn current_with_span(span: Span) -> Self {
        Context::current_with_synchronized_span(span.into())
    }

    fn with_span(&self, span: Span) -> Self {
        self.with_synchronized_span(span.into())
    }

    fn span(&self) -> SpanRef<'_> {
        if let Some(span) = self.span.as_ref() {
            SpanRef(span)
        } else {
            SpanRef(&NOOP_SPAN)
        }
    }

    fn has_active_span(&self) -> bool {
        self.span.is_some()
    }

    fn with_remote_span_context(&self, span_context: SpanContext) -> Self {
        self.with_synchronized_span(span_context.into())
    }
}

impl Context {
    /// The span context carried by this context, if any.
    pub(crate) fn span_context(&self) -> Option<&SpanContext> {
        self.span.as_ref().map(|span| span.span_context())
    }
}

/// Mark a given span as active in the current context for the lifetime of
/// the returned guard.
///
/// # Examples
///
/// ```
/// use traceline::trace::{get_active_span, mark_span_as_active, TracerProvider};
///
/// let provider = TracerProvider::default();
/// let tracer = provider.tracer("my-component");
///
/// let span = tracer.start("span-name");
/// let _guard = mark_span_as_active(span);
///
/// // anything happening in functions called from here can still access the
/// // active span:
/// get_active_span(|span| {
///     span.add_event("an event", vec![]);
/// });
/// ```
#[must_use = "Dropping the guard detaches the context."]
pub fn mark_span_as_active(span: Span) -> ContextGuard {
    let cx = Context::current_with_span(span);
    cx.attach()
}

/// Executes a closure with a reference to this thread's current span.
pub fn get_active_span<F, T>(f: F) -> T
where
    F: FnOnce(SpanRef<'_>) -> T,
{
    Context::map_current(|cx| f(cx.span()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{SpanId, TraceFlags, TraceId, TraceState};

    #[test]
    fn no_span_yields_noop_ref() {
        let cx = Context::new();
        assert!(!cx.has_active_span());
        assert!(!cx.span().is_recording());
        assert_eq!(cx.span().span_context(), &SpanContext::NONE);
    }

    #[test]
    fn remote_span_context_round_trips() {
        let span_context = SpanContext::new(
            TraceId::from(42u128),
            SpanId::from(7u64),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        let cx = Context::new().with_remote_span_context(span_context.clone());
        assert!(cx.has_active_span());
        assert_eq!(cx.span().span_context(), &span_context);
        // Propagated contexts carry no live span to mutate.
        assert!(!cx.span().is_recording());
    }
}
