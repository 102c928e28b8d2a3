//! Span creation.
//!
//! The `Tracer` turns a [`SpanBuilder`] into a live [`Span`]: it resolves the
//! parent from the builder's [`ParentSource`], consults the sampler, builds
//! the span, and notifies the registered processors.

use crate::trace::context::TraceContextExt;
use crate::trace::span::SpanInner;
use crate::trace::{
    mark_span_as_active, EvictedHashMap, EvictedQueue, Link, SamplingDecision, SamplingParameters,
    SamplingResult, ShouldSample, Span, SpanContext, SpanId, SpanKind, Status, TracerProvider,
};
use crate::{Context, ContextGuard, InstrumentationScope, KeyValue};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::SystemTime;

/// Creates and manages spans for one instrumented library.
///
/// Obtained from a [`TracerProvider`]; cheap to clone.
#[derive(Clone, Debug)]
pub struct Tracer {
    scope: Arc<InstrumentationScope>,
    provider: TracerProvider,
}

impl Tracer {
    pub(crate) fn new(scope: Arc<InstrumentationScope>, provider: TracerProvider) -> Self {
        Tracer { scope, provider }
    }

    /// The provider this tracer was created by.
    pub(crate) fn provider(&self) -> &TracerProvider {
        &self.provider
    }

    /// The instrumentation scope of this tracer.
    pub fn instrumentation_scope(&self) -> &InstrumentationScope {
        &self.scope
    }

    /// Start building a span with the given name.
    pub fn span_builder(&self, name: impl Into<Cow<'static, str>>) -> SpanBuilder {
        SpanBuilder::from_name(name)
    }

    /// Start a span with the given name, parented from the current context.
    pub fn start(&self, name: impl Into<Cow<'static, str>>) -> Span {
        self.build(SpanBuilder::from_name(name))
    }

    /// Start a span with the given name, parented from an explicit context.
    pub fn start_with_context(&self, name: impl Into<Cow<'static, str>>, cx: &Context) -> Span {
        self.build(SpanBuilder::from_name(name).with_parent_context(cx.clone()))
    }

    /// Start a span and mark it active for the lifetime of the returned
    /// guard.
    #[must_use = "dropping the guard deactivates the span"]
    pub fn with_span(&self, span: Span) -> ContextGuard {
        mark_span_as_active(span)
    }

    /// Run `f` inside a span with the given name: the span is started,
    /// marked active, and ended when `f` returns (on every exit path).
    pub fn in_span<T, F>(&self, name: impl Into<Cow<'static, str>>, f: F) -> T
    where
        F: FnOnce(Context) -> T,
    {
        let span = self.start(name);
        let cx = Context::current_with_span(span);
        let _guard = cx.clone().attach();
        f(cx)
    }

    /// Start a span from a fully configured [`SpanBuilder`].
    ///
    /// Performs parent resolution, the sampling decision, span construction,
    /// and the `on_start` notification, in that order. A failing sampler is
    /// collapsed to a drop decision; span creation itself cannot fail.
    pub fn build(&self, mut builder: SpanBuilder) -> Span {
        let provider = &self.provider;
        if provider.is_shutdown() {
            return Span::new(
                SpanContext::empty_context(),
                None,
                self.clone(),
                provider.config().span_limits,
            );
        }

        let config = provider.config();

        // Exactly one parent resolution path is active, chosen by the last
        // builder setter called.
        let parent_cx = match std::mem::take(&mut builder.parent) {
            ParentSource::CurrentContext => Context::current(),
            ParentSource::Context(cx) => cx,
            ParentSource::Span(span_context) => {
                Context::current().with_remote_span_context(span_context)
            }
            ParentSource::Remote(span_context) => {
                let span_context = SpanContext::new(
                    span_context.trace_id(),
                    span_context.span_id(),
                    span_context.trace_flags(),
                    true,
                    span_context.trace_state().clone(),
                );
                Context::current().with_remote_span_context(span_context)
            }
            ParentSource::NoParent => Context::current().with_cleared_span(),
        };

        let parent_sc = parent_cx
            .span_context()
            .filter(|span_context| span_context.is_valid())
            .cloned();
        let trace_id = parent_sc
            .as_ref()
            .map(|span_context| span_context.trace_id())
            .unwrap_or_else(|| config.id_generator.new_trace_id());
        let span_id = config.id_generator.new_span_id();

        let span_kind = builder.span_kind.take().unwrap_or(SpanKind::Internal);
        let sampling_result = {
            let params = SamplingParameters {
                parent_context: Some(&parent_cx),
                trace_id,
                name: &builder.name,
                span_kind,
                links: builder.links.as_deref().unwrap_or(&[]),
            };
            let sampler: &dyn ShouldSample = builder
                .sampler
                .as_deref()
                .unwrap_or_else(|| config.sampler.as_ref());
            sampler.should_sample(&params).unwrap_or_else(|err| {
                tracing::warn!(error = %err, span = %builder.name, "sampler failed, dropping span");
                SamplingResult::new(SamplingDecision::Drop)
            })
        };

        let mut decision = sampling_result.decision;
        if decision == SamplingDecision::Drop && builder.record_events {
            decision = SamplingDecision::RecordOnly;
        }

        let parent_flags = parent_sc
            .as_ref()
            .map(|span_context| span_context.trace_flags())
            .unwrap_or_default();
        let trace_state = sampling_result.trace_state.unwrap_or_else(|| {
            parent_sc
                .as_ref()
                .map(|span_context| span_context.trace_state().clone())
                .unwrap_or_default()
        });

        let flags = parent_flags.with_sampled(decision == SamplingDecision::RecordAndSample);
        let span_context = SpanContext::new(trace_id, span_id, flags, false, trace_state);
        let span_limits = config.span_limits;

        let mut span = if decision.is_recording() {
            let mut attributes = EvictedHashMap::new(span_limits.max_attributes_per_span);
            attributes.extend(builder.attributes.take().unwrap_or_default());
            attributes.extend(sampling_result.attributes);

            let mut links = EvictedQueue::new(span_limits.max_links_per_span);
            if let Some(link_options) = builder.links.take() {
                let link_attributes_limit = span_limits.max_attributes_per_link as usize;
                for mut link in link_options {
                    let dropped = link.attributes.len().saturating_sub(link_attributes_limit);
                    link.attributes.truncate(link_attributes_limit);
                    link.dropped_attributes_count += dropped as u32;
                    links.push_back(link);
                }
            }

            let start_time = builder.start_time.take().unwrap_or_else(SystemTime::now);

            Span::new(
                span_context,
                Some(SpanInner {
                    parent_span_id: parent_sc
                        .as_ref()
                        .map(|span_context| span_context.span_id())
                        .unwrap_or(SpanId::INVALID),
                    span_kind,
                    name: builder.name,
                    start_time,
                    end_time: start_time,
                    attributes,
                    events: EvictedQueue::new(span_limits.max_events_per_span),
                    links,
                    status: Status::Unset,
                }),
                self.clone(),
                span_limits,
            )
        } else {
            Span::new(span_context, None, self.clone(), span_limits)
        };

        if span.is_recording() {
            for processor in provider.span_processors() {
                processor.on_start(&mut span, &parent_cx);
            }
        }

        span
    }
}

/// Where a new span gets its parent from.
///
/// The builder keeps exactly one of these; every parent setter replaces the
/// whole value, so there is no stale combination of half-cleared fields.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub enum ParentSource {
    /// Resolve the parent from the ambient current context at start time.
    #[default]
    CurrentContext,
    /// Child of the given local span.
    Span(SpanContext),
    /// Child of whatever span the given context carries.
    Context(Context),
    /// Child of a span context propagated from a remote process.
    Remote(SpanContext),
    /// Start a new root trace.
    NoParent,
}

/// Accumulates the options for a span before it is started.
///
/// # Examples
///
/// ```
/// use traceline::trace::{SpanKind, TracerProvider};
///
/// let provider = TracerProvider::default();
/// let tracer = provider.tracer("checkout");
///
/// let span = tracer
///     .span_builder("charge-card")
///     .with_kind(SpanKind::Client)
///     .start(&tracer);
/// # drop(span);
/// ```
#[derive(Clone, Debug, Default)]
pub struct SpanBuilder {
    /// The span's name.
    pub name: Cow<'static, str>,
    /// Where the span's parent comes from.
    pub parent: ParentSource,
    /// The span kind; [`SpanKind::Internal`] if unset.
    pub span_kind: Option<SpanKind>,
    /// Attributes set at creation.
    pub attributes: Option<Vec<KeyValue>>,
    /// Links carried from creation.
    pub links: Option<Vec<Link>>,
    /// An explicit start time instead of "now".
    pub start_time: Option<SystemTime>,
    /// A sampler overriding the provider's configured one.
    pub sampler: Option<Box<dyn ShouldSample>>,
    /// Record the span even when the sampling decision is a drop.
    pub record_events: bool,
}

impl SpanBuilder {
    /// Create a builder for a span with the given name.
    pub fn from_name(name: impl Into<Cow<'static, str>>) -> Self {
        SpanBuilder {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parent the new span under the given span.
    pub fn with_parent_span(mut self, parent: &Span) -> Self {
        self.parent = ParentSource::Span(parent.span_context().clone());
        self
    }

    /// Parent the new span from whatever span the given context carries.
    pub fn with_parent_context(mut self, parent: Context) -> Self {
        self.parent = ParentSource::Context(parent);
        self
    }

    /// Parent the new span under a remote span context, e.g. one extracted
    /// from incoming request headers.
    pub fn with_remote_parent(mut self, parent: SpanContext) -> Self {
        self.parent = ParentSource::Remote(parent);
        self
    }

    /// Make the new span the root of a new trace.
    pub fn with_no_parent(mut self) -> Self {
        self.parent = ParentSource::NoParent;
        self
    }

    /// Set the span kind.
    pub fn with_kind(mut self, span_kind: SpanKind) -> Self {
        self.span_kind = Some(span_kind);
        self
    }

    /// Set attributes recorded at creation.
    pub fn with_attributes(mut self, attributes: Vec<KeyValue>) -> Self {
        self.attributes = Some(attributes);
        self
    }

    /// Set links carried from creation.
    pub fn with_links(mut self, links: Vec<Link>) -> Self {
        self.links = Some(links);
        self
    }

    /// Set an explicit start time.
    pub fn with_start_time(mut self, start_time: SystemTime) -> Self {
        self.start_time = Some(start_time);
        self
    }

    /// Override the provider's sampler for this span only.
    pub fn with_sampler(mut self, sampler: impl ShouldSample + 'static) -> Self {
        self.sampler = Some(Box::new(sampler));
        self
    }

    /// Record the span even when the sampling decision is a drop. The span
    /// is then recorded but not exported.
    pub fn with_record_events(mut self, record_events: bool) -> Self {
        self.record_events = record_events;
        self
    }

    /// Start the span through the given tracer.
    pub fn start(self, tracer: &Tracer) -> Span {
        tracer.build(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{
        InMemorySpanExporter, Sampler, SamplingResult, SimpleSpanProcessor, TraceFlags, TraceId,
        TraceResult, TraceState, TracerProvider,
    };

    fn pipeline() -> (InMemorySpanExporter, TracerProvider) {
        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_span_processor(SimpleSpanProcessor::new(Box::new(exporter.clone())))
            .build();
        (exporter, provider)
    }

    #[test]
    fn remote_sampled_parent_with_always_off_root_samples_child() {
        let provider = TracerProvider::builder()
            .with_sampler(Sampler::ParentBased(Box::new(Sampler::AlwaysOff)))
            .build();
        let tracer = provider.tracer("test");

        let remote = SpanContext::new(
            TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736u128),
            SpanId::from(0x00f0_67aa_0ba9_02b7u64),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );

        let span = tracer
            .span_builder("inbound")
            .with_remote_parent(remote.clone())
            .with_kind(SpanKind::Server)
            .start(&tracer);

        assert!(span.span_context().is_sampled());
        assert_eq!(span.span_context().trace_id(), remote.trace_id());
        assert_ne!(span.span_context().span_id(), remote.span_id());
    }

    #[test]
    fn no_parent_forces_fresh_root() {
        let (_, provider) = pipeline();
        let tracer = provider.tracer("test");

        let parent = tracer.start("parent");
        let parent_trace_id = parent.span_context().trace_id();
        let _guard = Context::current_with_span(parent).attach();

        let root = tracer
            .span_builder("detached")
            .with_no_parent()
            .start(&tracer);

        assert_ne!(root.span_context().trace_id(), parent_trace_id);

        let child = tracer.span_builder("attached").start(&tracer);
        assert_eq!(child.span_context().trace_id(), parent_trace_id);
    }

    #[test]
    fn child_spans_inherit_trace_id_and_parent_span_id() {
        let (exporter, provider) = pipeline();
        let tracer = provider.tracer("test");

        let parent = tracer.start("parent");
        let parent_span_id = parent.span_context().span_id();
        let parent_trace_id = parent.span_context().trace_id();
        let parent_cx = Context::current_with_span(parent);

        let mut child = tracer.start_with_context("child", &parent_cx);
        child.end();
        drop(parent_cx);

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 2);
        let child = spans.iter().find(|s| s.name == "child").unwrap();
        assert_eq!(child.parent_span_id, parent_span_id);
        assert_eq!(child.span_context.trace_id(), parent_trace_id);
    }

    #[test]
    fn explicit_parent_span_wins_over_ambient() {
        let (_, provider) = pipeline();
        let tracer = provider.tracer("test");

        let ambient = tracer.start("ambient");
        let ambient_trace_id = ambient.span_context().trace_id();
        let _guard = Context::current_with_span(ambient).attach();

        let explicit = tracer.span_builder("explicit").with_no_parent().start(&tracer);

        let child = tracer
            .span_builder("child")
            .with_parent_span(&explicit)
            .start(&tracer);

        assert_eq!(
            child.span_context().trace_id(),
            explicit.span_context().trace_id()
        );
        assert_ne!(child.span_context().trace_id(), ambient_trace_id);
    }

    #[test]
    fn last_parent_setter_wins() {
        let (_, provider) = pipeline();
        let tracer = provider.tracer("test");

        let remote = SpanContext::new(
            TraceId::from(77u128),
            SpanId::from(7u64),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );

        let span = tracer
            .span_builder("op")
            .with_remote_parent(remote)
            .with_no_parent()
            .start(&tracer);

        assert_ne!(span.span_context().trace_id(), TraceId::from(77u128));
    }

    #[test]
    fn record_events_upgrades_drop_to_record_only() {
        let (exporter, provider) = pipeline();
        let tracer = provider.tracer("test");

        let mut span = tracer
            .span_builder("recorded-not-sampled")
            .with_sampler(Sampler::AlwaysOff)
            .with_record_events(true)
            .start(&tracer);

        assert!(span.is_recording());
        assert!(!span.span_context().is_sampled());

        span.end();
        // Recording but unsampled spans never reach the exporter.
        assert!(exporter.get_finished_spans().unwrap().is_empty());
    }

    #[test]
    fn dropped_spans_do_not_record() {
        let provider = TracerProvider::builder()
            .with_sampler(Sampler::AlwaysOff)
            .build();
        let tracer = provider.tracer("test");

        let mut span = tracer.start("invisible");
        assert!(!span.is_recording());
        span.set_attribute(KeyValue::new("ignored", true));
        assert!(span.exported_data().is_none());
    }

    #[test]
    fn sampler_trace_state_lands_in_child_context() {
        #[derive(Clone, Debug)]
        struct StampingSampler;

        impl ShouldSample for StampingSampler {
            fn should_sample(
                &self,
                params: &SamplingParameters<'_>,
            ) -> TraceResult<SamplingResult> {
                let state = params
                    .parent_span_context()
                    .map(|sc| sc.trace_state().clone())
                    .unwrap_or_default();
                Ok(
                    SamplingResult::new(SamplingDecision::RecordAndSample)
                        .with_trace_state(state.insert("stamp", "yes")?),
                )
            }
        }

        let provider = TracerProvider::builder()
            .with_sampler(StampingSampler)
            .build();
        let tracer = provider.tracer("test");

        let span = tracer.start("stamped");
        assert_eq!(span.span_context().trace_state().get("stamp"), Some("yes"));
    }

    #[test]
    fn sampler_failure_collapses_to_drop() {
        #[derive(Clone, Debug)]
        struct BrokenSampler;

        impl ShouldSample for BrokenSampler {
            fn should_sample(
                &self,
                _params: &SamplingParameters<'_>,
            ) -> TraceResult<SamplingResult> {
                Err("remote config unavailable".into())
            }
        }

        let provider = TracerProvider::builder().with_sampler(BrokenSampler).build();
        let tracer = provider.tracer("test");

        let span = tracer.start("unsampled");
        assert!(!span.is_recording());
        assert!(!span.span_context().is_sampled());
    }

    #[test]
    fn in_span_parents_nested_spans_and_ends_on_exit() {
        let (exporter, provider) = pipeline();
        let tracer = provider.tracer("test");

        let mut inner_trace_id = None;
        tracer.in_span("outer", |cx| {
            let outer_sc = cx.span().span_context().clone();
            let inner = tracer.start("inner");
            inner_trace_id = Some(inner.span_context().trace_id());
            assert_eq!(inner.span_context().trace_id(), outer_sc.trace_id());
        });

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 2);
        assert!(spans.iter().any(|s| s.name == "outer"));
    }

    #[test]
    fn builder_attributes_and_sampler_attributes_merge() {
        #[derive(Clone, Debug)]
        struct AttributeSampler;

        impl ShouldSample for AttributeSampler {
            fn should_sample(
                &self,
                _params: &SamplingParameters<'_>,
            ) -> TraceResult<SamplingResult> {
                Ok(SamplingResult::new(SamplingDecision::RecordAndSample)
                    .with_attributes(vec![KeyValue::new("from.sampler", true)]))
            }
        }

        let provider = TracerProvider::builder()
            .with_sampler(AttributeSampler)
            .build();
        let tracer = provider.tracer("test");

        let span = tracer
            .span_builder("merged")
            .with_attributes(vec![KeyValue::new("from.builder", true)])
            .start(&tracer);

        let data = span.exported_data().unwrap();
        assert!(data.attributes.get(&crate::Key::new("from.builder")).is_some());
        assert!(data.attributes.get(&crate::Key::new("from.sampler")).is_some());
    }
}
