//! Creator and registry of [`Tracer`] instances.
//!
//! The `TracerProvider` is the assembly point of the pipeline: it owns the
//! sampler, the id generator, the resource labels, and the span processors,
//! and hands out tracers memoized by `(name, version)`. It is an explicit,
//! constructed object — build one at startup and inject it everywhere; there
//! is no process-global instance.
//!
//! Cloning a provider creates a new handle to the same pipeline. Dropping
//! the last handle shuts the pipeline down, flushing buffered spans;
//! [`TracerProvider::shutdown`] does the same eagerly.

use crate::trace::{
    BatchSpanProcessor, Config, IdGenerator, ShouldSample, SimpleSpanProcessor, SpanExporter,
    SpanLimits, SpanProcessor, TraceError, TraceResult, Tracer,
};
use crate::{InstrumentationScope, Resource};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type ScopeKey = (Cow<'static, str>, Option<Cow<'static, str>>);

#[derive(Debug)]
pub(crate) struct TracerProviderInner {
    processors: Vec<Box<dyn SpanProcessor>>,
    config: Config,
    scopes: Mutex<HashMap<ScopeKey, Arc<InstrumentationScope>>>,
    is_shutdown: AtomicBool,
}

impl TracerProviderInner {
    /// Shut down every processor, collecting the individual results.
    fn shutdown(&self, timeout: Option<Duration>) -> Vec<TraceResult<()>> {
        let mut results = Vec::with_capacity(self.processors.len());
        for processor in &self.processors {
            let result = processor.shutdown(timeout);
            if let Err(err) = &result {
                tracing::debug!(error = %err, "span processor shutdown failed");
            }
            results.push(result);
        }
        results
    }
}

impl Drop for TracerProviderInner {
    fn drop(&mut self) {
        if !self.is_shutdown.load(Ordering::Relaxed) {
            let _ = self.shutdown(Some(DEFAULT_SHUTDOWN_TIMEOUT));
        }
    }
}

/// Creator and registry of [`Tracer`] instances.
///
/// # Examples
///
/// ```
/// use traceline::trace::{InMemorySpanExporter, TracerProvider};
///
/// let exporter = InMemorySpanExporter::default();
/// let provider = TracerProvider::builder()
///     .with_simple_exporter(exporter)
///     .build();
///
/// let tracer = provider.tracer("my-library");
/// tracer.in_span("operation", |_cx| {
///     // traced work here
/// });
///
/// provider.shutdown().unwrap();
/// ```
#[derive(Clone, Debug)]
pub struct TracerProvider {
    inner: Arc<TracerProviderInner>,
}

impl Default for TracerProvider {
    fn default() -> Self {
        TracerProvider::builder().build()
    }
}

impl TracerProvider {
    /// Create a new builder.
    pub fn builder() -> TracerProviderBuilder {
        TracerProviderBuilder::default()
    }

    /// Obtain a tracer for the given instrumented library name.
    pub fn tracer(&self, name: impl Into<Cow<'static, str>>) -> Tracer {
        self.tracer_with_scope(InstrumentationScope::new(name))
    }

    /// Obtain a tracer for the given instrumentation scope.
    ///
    /// Scopes are memoized by `(name, version)`: asking twice for the same
    /// scope yields tracers sharing one identity.
    pub fn tracer_with_scope(&self, scope: InstrumentationScope) -> Tracer {
        if scope.name().is_empty() {
            tracing::debug!("tracer created with an empty name; consider a meaningful one");
        }
        let key: ScopeKey = (
            Cow::Owned(scope.name().to_string()),
            scope.version().map(|v| Cow::Owned(v.to_string())),
        );
        let scope = {
            let mut scopes = self
                .inner
                .scopes
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            scopes.entry(key).or_insert_with(|| Arc::new(scope)).clone()
        };
        Tracer::new(scope, self.clone())
    }

    /// Span processors associated with this provider.
    pub(crate) fn span_processors(&self) -> &[Box<dyn SpanProcessor>] {
        &self.inner.processors
    }

    /// Config associated with this provider.
    pub(crate) fn config(&self) -> &Config {
        &self.inner.config
    }

    /// `true` once the provider has been shut down; spans are neither
    /// started nor exported afterwards.
    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown.load(Ordering::Relaxed)
    }

    /// Push all buffered spans through to the exporters, blocking up to
    /// `timeout` per processor.
    pub fn force_flush_with_timeout(&self, timeout: Option<Duration>) -> TraceResult<()> {
        let errors: Vec<String> = self
            .span_processors()
            .iter()
            .map(|processor| processor.force_flush(timeout))
            .filter_map(|result| result.err().map(|err| err.to_string()))
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TraceError::Other(errors.join("; ")))
        }
    }

    /// Push all buffered spans through to the exporters.
    pub fn force_flush(&self) -> TraceResult<()> {
        self.force_flush_with_timeout(None)
    }

    /// Shut down this provider: stop accepting spans, flush the remainder
    /// bounded by `timeout` per processor, and shut down the exporters.
    ///
    /// Only the first call has effect; later calls report
    /// [`TraceError::AlreadyShutdown`].
    pub fn shutdown_with_timeout(&self, timeout: Option<Duration>) -> TraceResult<()> {
        if self
            .inner
            .is_shutdown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let results = self.inner.shutdown(timeout);
            let errors: Vec<String> = results
                .into_iter()
                .filter_map(|result| result.err().map(|err| err.to_string()))
                .collect();
            if errors.is_empty() {
                Ok(())
            } else {
                Err(TraceError::Other(errors.join("; ")))
            }
        } else {
            Err(TraceError::AlreadyShutdown)
        }
    }

    /// Shut down this provider with the default timeout.
    pub fn shutdown(&self) -> TraceResult<()> {
        self.shutdown_with_timeout(Some(DEFAULT_SHUTDOWN_TIMEOUT))
    }
}

/// Builder for [`TracerProvider`].
#[derive(Debug, Default)]
pub struct TracerProviderBuilder {
    processors: Vec<Box<dyn SpanProcessor>>,
    config: Config,
}

impl TracerProviderBuilder {
    /// Add a [`SimpleSpanProcessor`] around the given exporter.
    ///
    /// Processors are invoked in the order they are added.
    pub fn with_simple_exporter<T: SpanExporter + 'static>(self, exporter: T) -> Self {
        self.with_span_processor(SimpleSpanProcessor::new(Box::new(exporter)))
    }

    /// Add a [`BatchSpanProcessor`] with default batching configuration
    /// around the given exporter.
    ///
    /// Processors are invoked in the order they are added.
    pub fn with_batch_exporter<T: SpanExporter + 'static>(self, exporter: T) -> Self {
        self.with_span_processor(BatchSpanProcessor::builder(exporter).build())
    }

    /// Add a span processor to the pipeline.
    ///
    /// Processors are invoked in the order they are added.
    pub fn with_span_processor<T: SpanProcessor + 'static>(mut self, processor: T) -> Self {
        self.processors.push(Box::new(processor));
        self
    }

    /// Set the sampler consulted for every created span.
    pub fn with_sampler<T: ShouldSample + 'static>(mut self, sampler: T) -> Self {
        self.config.sampler = Box::new(sampler);
        self
    }

    /// Set the id generator.
    pub fn with_id_generator<T: IdGenerator + 'static>(mut self, id_generator: T) -> Self {
        self.config.id_generator = Box::new(id_generator);
        self
    }

    /// Set the span collection limits.
    pub fn with_span_limits(mut self, span_limits: SpanLimits) -> Self {
        self.config.span_limits = span_limits;
        self
    }

    /// Set the resource labels stamped on every exported span.
    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.config.resource = Cow::Owned(resource);
        self
    }

    /// Build the provider.
    pub fn build(self) -> TracerProvider {
        TracerProvider {
            inner: Arc::new(TracerProviderInner {
                processors: self.processors,
                config: self.config,
                scopes: Mutex::new(HashMap::new()),
                is_shutdown: AtomicBool::new(false),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{InMemorySpanExporter, Sampler};
    use crate::{KeyValue, Value};

    #[test]
    fn tracers_memoized_by_name_and_version() {
        let provider = TracerProvider::default();

        let a = provider.tracer_with_scope(InstrumentationScope::new("lib").with_version("1"));
        let b = provider.tracer_with_scope(InstrumentationScope::new("lib").with_version("1"));
        let c = provider.tracer_with_scope(InstrumentationScope::new("lib").with_version("2"));

        // Same (name, version) shares one memoized scope allocation.
        assert!(std::ptr::eq(
            a.instrumentation_scope(),
            b.instrumentation_scope()
        ));
        assert!(!std::ptr::eq(
            a.instrumentation_scope(),
            c.instrumentation_scope()
        ));
    }

    #[test]
    fn spans_after_shutdown_are_noops() {
        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let tracer = provider.tracer("test");

        provider.shutdown().unwrap();

        let mut span = tracer.start("ignored");
        assert!(!span.is_recording());
        span.end();
        assert!(exporter.get_finished_spans().unwrap().is_empty());
    }

    #[test]
    fn shutdown_only_first_call_has_effect() {
        let provider = TracerProvider::default();
        assert!(provider.shutdown().is_ok());
        assert!(matches!(
            provider.shutdown(),
            Err(TraceError::AlreadyShutdown)
        ));
    }

    #[test]
    fn resource_is_stamped_on_exported_spans() {
        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .with_resource(
                Resource::builder()
                    .with_service_name("checkout")
                    .with_attribute(KeyValue::new("service.version", "1.2.3"))
                    .build(),
            )
            .build();

        provider.tracer("test").start("op").end();

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(
            spans[0].resource.get(&crate::resource::SERVICE_NAME),
            Some(&Value::from("checkout"))
        );
    }

    #[test]
    fn instrumentation_scope_is_stamped_on_exported_spans() {
        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();

        provider
            .tracer_with_scope(InstrumentationScope::new("http-client").with_version("0.3"))
            .start("request")
            .end();

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans[0].instrumentation_scope.name(), "http-client");
        assert_eq!(spans[0].instrumentation_scope.version(), Some("0.3"));
    }

    #[test]
    fn drop_of_last_handle_flushes_processors() {
        use crate::trace::{ExportResult, SpanData};
        use futures_util::future::BoxFuture;
        use std::sync::atomic::{AtomicUsize, Ordering};

        #[derive(Debug)]
        struct CountingExporter {
            exported: Arc<AtomicUsize>,
        }

        impl SpanExporter for CountingExporter {
            fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
                self.exported.fetch_add(batch.len(), Ordering::SeqCst);
                Box::pin(async { Ok(()) })
            }
        }

        let exported = Arc::new(AtomicUsize::new(0));
        {
            let provider = TracerProvider::builder()
                .with_batch_exporter(CountingExporter {
                    exported: exported.clone(),
                })
                .with_sampler(Sampler::AlwaysOn)
                .build();
            provider.tracer("test").start("flushed-on-drop").end();
        }
        // Dropping the last handle shut the batch processor down, draining
        // the buffered span.
        assert_eq!(exported.load(Ordering::SeqCst), 1);
    }
}
