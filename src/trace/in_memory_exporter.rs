use crate::trace::{ExportResult, SpanData, SpanExporter, TraceError, TraceResult};
use futures_util::future::BoxFuture;
use std::sync::{Arc, Mutex};

/// An exporter that keeps finished spans in memory.
///
/// Useful for tests and debugging: clones share the same storage, so a clone
/// registered with a pipeline can be inspected from the test body.
///
/// # Examples
///
/// ```
/// use traceline::trace::{InMemorySpanExporter, SimpleSpanProcessor, TracerProvider};
///
/// let exporter = InMemorySpanExporter::default();
/// let provider = TracerProvider::builder()
///     .with_span_processor(SimpleSpanProcessor::new(Box::new(exporter.clone())))
///     .build();
///
/// let tracer = provider.tracer("test");
/// tracer.start("operation").end();
///
/// assert_eq!(exporter.get_finished_spans().unwrap().len(), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemorySpanExporter {
    spans: Arc<Mutex<Vec<SpanData>>>,
}

impl InMemorySpanExporter {
    /// Returns a copy of the finished spans received so far.
    pub fn get_finished_spans(&self) -> TraceResult<Vec<SpanData>> {
        self.spans
            .lock()
            .map(|spans| spans.clone())
            .map_err(|err| TraceError::Other(format!("finished spans lock poisoned: {err}")))
    }

    /// Clears the stored spans.
    pub fn reset(&self) {
        if let Ok(mut spans) = self.spans.lock() {
            spans.clear();
        }
    }
}

impl SpanExporter for InMemorySpanExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        let spans = self.spans.clone();
        Box::pin(async move {
            spans
                .lock()
                .map(|mut stored| stored.extend(batch))
                .map_err(|err| TraceError::Other(format!("finished spans lock poisoned: {err}")))
        })
    }

    fn shutdown(&mut self) {
        self.reset();
    }
}
