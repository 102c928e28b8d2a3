//! Span processor pipeline.
//!
//! Span processors hook span start and end. Both hooks are called
//! synchronously on the instrumented thread, so they must be fast and must
//! not fail: everything that can take time (exporting) happens on a
//! dedicated worker behind a bounded queue.
//!
//! ```ascii
//!   +-------------+--------------+   +-----------------------+   +----------------+
//!   |             |              |   |                       |   |                |
//!   |             |              +---> MultiSpanProcessor    |   |  SpanExporter  |
//!   |             |              |   |   BatchSpanProcessor  +--->  (vendor wire  |
//!   |   Tracer    | span.end()   |   |   SimpleSpanProcessor |   |     format)    |
//!   |             |              |   |                       |   |                |
//!   +-------------+--------------+   +-----------------------+   +----------------+
//! ```

use crate::trace::{Span, SpanData, SpanExporter, TraceError, TraceResult};
use crate::Context;
use futures_executor::block_on;
use futures_util::future::{self, Either};
use std::cmp::min;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use std::{env, str::FromStr, thread};

/// Maximum queue size for the batching processor.
const BSP_MAX_QUEUE_SIZE: &str = "TRACELINE_BSP_MAX_QUEUE_SIZE";
const BSP_MAX_QUEUE_SIZE_DEFAULT: usize = 2_048;
/// Delay interval (ms) between two consecutive batch exports.
const BSP_SCHEDULE_DELAY: &str = "TRACELINE_BSP_SCHEDULE_DELAY";
const BSP_SCHEDULE_DELAY_DEFAULT: u64 = 5_000;
/// Maximum batch size, must be less than or equal to the max queue size.
const BSP_MAX_EXPORT_BATCH_SIZE: &str = "TRACELINE_BSP_MAX_EXPORT_BATCH_SIZE";
const BSP_MAX_EXPORT_BATCH_SIZE_DEFAULT: usize = 512;
/// Maximum allowed time (ms) to export one batch.
const BSP_EXPORT_TIMEOUT: &str = "TRACELINE_BSP_EXPORT_TIMEOUT";
const BSP_EXPORT_TIMEOUT_DEFAULT: u64 = 30_000;

/// Hooks for span start and end.
///
/// Implementations must be fast and non-blocking, and must not fail in ways
/// visible to the instrumented caller; problems are reported through the
/// diagnostics log and the `force_flush`/`shutdown` results.
pub trait SpanProcessor: Send + Sync + fmt::Debug {
    /// Called when a span is started. Called synchronously on the thread
    /// that started the span.
    fn on_start(&self, span: &mut Span, cx: &Context);

    /// Called when a span is ended, with the finished span's data. Called
    /// synchronously from `Span::end`.
    fn on_end(&self, span: SpanData);

    /// Export any buffered spans, blocking the caller up to `timeout`
    /// (`None` waits indefinitely). A timeout is reported as
    /// [`TraceError::ExportTimedOut`], never a panic.
    fn force_flush(&self, timeout: Option<Duration>) -> TraceResult<()>;

    /// Stop accepting spans, flush the remainder up to `timeout`, and shut
    /// down the exporter. Only the first call has effect; later calls
    /// report [`TraceError::AlreadyShutdown`].
    fn shutdown(&self, timeout: Option<Duration>) -> TraceResult<()>;
}

/// A [`SpanProcessor`] that exports each finished span inline, without
/// batching.
///
/// Useful for debugging and tests; production pipelines should prefer
/// [`BatchSpanProcessor`].
#[derive(Debug)]
pub struct SimpleSpanProcessor {
    exporter: Mutex<Box<dyn SpanExporter>>,
}

impl SimpleSpanProcessor {
    /// Create a new processor around the given exporter.
    pub fn new(exporter: Box<dyn SpanExporter>) -> Self {
        Self {
            exporter: Mutex::new(exporter),
        }
    }
}

impl SpanProcessor for SimpleSpanProcessor {
    fn on_start(&self, _span: &mut Span, _cx: &Context) {
        // Ignored
    }

    fn on_end(&self, span: SpanData) {
        if !span.span_context.is_sampled() {
            return;
        }

        let result = self
            .exporter
            .lock()
            .map_err(|_| TraceError::Other("simple processor exporter lock poisoned".into()))
            .and_then(|mut exporter| block_on(exporter.export(vec![span])));

        if let Err(err) = result {
            tracing::debug!(error = %err, "inline span export failed");
        }
    }

    fn force_flush(&self, _timeout: Option<Duration>) -> TraceResult<()> {
        // Nothing is buffered.
        Ok(())
    }

    fn shutdown(&self, _timeout: Option<Duration>) -> TraceResult<()> {
        let mut exporter = self
            .exporter
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        exporter.shutdown();
        Ok(())
    }
}

/// Fans out start/end notifications to an ordered list of processors.
///
/// `shutdown` runs the children concurrently and aggregates failures, so a
/// slow child cannot serialize the others' deadlines.
#[derive(Debug)]
pub struct MultiSpanProcessor {
    processors: Vec<Box<dyn SpanProcessor>>,
}

impl MultiSpanProcessor {
    /// Create a new processor fanning out to `processors`, in order.
    pub fn new(processors: Vec<Box<dyn SpanProcessor>>) -> Self {
        Self { processors }
    }
}

impl SpanProcessor for MultiSpanProcessor {
    fn on_start(&self, span: &mut Span, cx: &Context) {
        for processor in &self.processors {
            processor.on_start(span, cx);
        }
    }

    fn on_end(&self, span: SpanData) {
        if let [rest @ .., last] = self.processors.as_slice() {
            for processor in rest {
                processor.on_end(span.clone());
            }
            last.on_end(span);
        }
    }

    fn force_flush(&self, timeout: Option<Duration>) -> TraceResult<()> {
        aggregate(
            self.processors
                .iter()
                .map(|processor| processor.force_flush(timeout))
                .collect(),
        )
    }

    fn shutdown(&self, timeout: Option<Duration>) -> TraceResult<()> {
        let results = thread::scope(|scope| {
            let handles: Vec<_> = self
                .processors
                .iter()
                .map(|processor| scope.spawn(move || processor.shutdown(timeout)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(TraceError::Other("span processor shutdown panicked".into()))
                    })
                })
                .collect::<Vec<_>>()
        });
        aggregate(results)
    }
}

fn aggregate(results: Vec<TraceResult<()>>) -> TraceResult<()> {
    let errors: Vec<String> = results
        .into_iter()
        .filter_map(|result| result.err().map(|err| err.to_string()))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(TraceError::Other(errors.join("; ")))
    }
}

/// Messages exchanged between producer threads and the batch worker.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
enum BatchMessage {
    ExportSpan(SpanData),
    ForceFlush(SyncSender<TraceResult<()>>),
    Shutdown(SyncSender<TraceResult<()>>),
}

/// A [`SpanProcessor`] buffering finished spans in a bounded queue, drained
/// by one dedicated background worker thread.
///
/// Producers never block: when the queue is full the incoming span is
/// dropped and counted. The worker exports a batch when it reaches the
/// configured batch size or when the flush interval elapses, whichever
/// happens first, and each export call is bounded by the export timeout.
#[derive(Debug)]
pub struct BatchSpanProcessor {
    message_sender: SyncSender<BatchMessage>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    is_shutdown: AtomicBool,
    dropped_spans: Arc<AtomicUsize>,
}

impl BatchSpanProcessor {
    /// Create a new batching processor around the given exporter.
    pub fn new<E>(exporter: E, config: BatchConfig) -> Self
    where
        E: SpanExporter + 'static,
    {
        let (message_sender, message_receiver) = sync_channel(config.max_queue_size);

        let handle = thread::Builder::new()
            .name("traceline-batch-worker".to_string())
            .spawn(move || {
                BatchWorker {
                    exporter,
                    config,
                    buffer: Vec::new(),
                    last_export: Instant::now(),
                }
                .run(message_receiver)
            })
            .expect("failed to spawn batch worker thread");

        Self {
            message_sender,
            handle: Mutex::new(Some(handle)),
            is_shutdown: AtomicBool::new(false),
            dropped_spans: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a builder to configure a `BatchSpanProcessor`.
    pub fn builder<E>(exporter: E) -> BatchSpanProcessorBuilder<E>
    where
        E: SpanExporter + 'static,
    {
        BatchSpanProcessorBuilder {
            exporter,
            config: BatchConfig::default(),
        }
    }

    fn await_reply(
        receiver: Receiver<TraceResult<()>>,
        timeout: Option<Duration>,
    ) -> TraceResult<()> {
        match timeout {
            Some(timeout) => receiver
                .recv_timeout(timeout)
                .map_err(|_| TraceError::ExportTimedOut(timeout))?,
            None => receiver
                .recv()
                .map_err(|_| TraceError::Other("batch worker terminated".into()))?,
        }
    }
}

impl SpanProcessor for BatchSpanProcessor {
    fn on_start(&self, _span: &mut Span, _cx: &Context) {
        // Ignored
    }

    fn on_end(&self, span: SpanData) {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return;
        }
        if !span.span_context.is_sampled() {
            return;
        }

        if self
            .message_sender
            .try_send(BatchMessage::ExportSpan(span))
            .is_err()
        {
            // Warn once on the first drop; the exact total is logged at
            // shutdown.
            if self.dropped_spans.fetch_add(1, Ordering::Relaxed) == 0 {
                tracing::warn!(
                    "span queue full, dropping span; further drops will be counted silently until shutdown"
                );
            }
        }
    }

    fn force_flush(&self, timeout: Option<Duration>) -> TraceResult<()> {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return Err(TraceError::AlreadyShutdown);
        }
        let (sender, receiver) = sync_channel(1);
        self.message_sender
            .try_send(BatchMessage::ForceFlush(sender))
            .map_err(|_| TraceError::Other("could not enqueue force flush message".into()))?;

        Self::await_reply(receiver, timeout)
    }

    fn shutdown(&self, timeout: Option<Duration>) -> TraceResult<()> {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return Err(TraceError::AlreadyShutdown);
        }

        let dropped = self.dropped_spans.load(Ordering::Relaxed);
        if dropped > 0 {
            tracing::warn!(count = dropped, "spans dropped due to a full queue");
        }

        let (sender, receiver) = sync_channel(1);
        self.message_sender
            .try_send(BatchMessage::Shutdown(sender))
            .map_err(|_| TraceError::Other("could not enqueue shutdown message".into()))?;

        let result = Self::await_reply(receiver, timeout);
        // Join only after the worker acknowledged; on timeout the worker may
        // still be draining and will exit on its own.
        if result.is_ok() {
            if let Some(handle) = self
                .handle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                if handle.join().is_err() {
                    tracing::warn!("batch worker panicked during shutdown");
                }
            }
        }
        result
    }
}

struct BatchWorker<E> {
    exporter: E,
    config: BatchConfig,
    buffer: Vec<SpanData>,
    last_export: Instant,
}

impl<E: SpanExporter> BatchWorker<E> {
    fn run(mut self, receiver: Receiver<BatchMessage>) {
        loop {
            let timeout = self
                .config
                .scheduled_delay
                .saturating_sub(self.last_export.elapsed());
            match receiver.recv_timeout(timeout) {
                Ok(BatchMessage::ExportSpan(span)) => {
                    self.buffer.push(span);
                    if self.buffer.len() >= self.config.max_export_batch_size {
                        self.export_one_batch();
                    }
                }
                Ok(BatchMessage::ForceFlush(sender)) => {
                    let result = self.drain();
                    let _ = sender.send(result);
                }
                Ok(BatchMessage::Shutdown(sender)) => {
                    let result = self.drain();
                    self.exporter.shutdown();
                    let _ = sender.send(result);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    // Interval elapsed: flush whatever accumulated.
                    if self.buffer.is_empty() {
                        self.last_export = Instant::now();
                    } else {
                        self.export_one_batch();
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    // All handles gone; drain and stop.
                    let _ = self.drain();
                    self.exporter.shutdown();
                    break;
                }
            }
        }
    }

    /// Export up to one batch worth of buffered spans, oldest first.
    fn export_one_batch(&mut self) {
        let batch_size = min(self.config.max_export_batch_size, self.buffer.len());
        let batch: Vec<_> = self.buffer.drain(..batch_size).collect();
        if let Err(err) = export_with_timeout(
            &mut self.exporter,
            batch,
            self.config.max_export_timeout,
        ) {
            tracing::warn!(error = %err, "batch export failed; batch discarded");
        }
        self.last_export = Instant::now();
    }

    /// Export everything buffered, batch by batch, reporting the first
    /// failure but always draining completely.
    fn drain(&mut self) -> TraceResult<()> {
        let mut result = Ok(());
        while !self.buffer.is_empty() {
            let batch_size = min(self.config.max_export_batch_size, self.buffer.len());
            let batch: Vec<_> = self.buffer.drain(..batch_size).collect();
            if let Err(err) =
                export_with_timeout(&mut self.exporter, batch, self.config.max_export_timeout)
            {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        self.last_export = Instant::now();
        result
    }
}

/// Run one export bounded by `timeout`; the worker owns no other clock, so a
/// hanging exporter cannot wedge flush or shutdown.
fn export_with_timeout<E: SpanExporter>(
    exporter: &mut E,
    batch: Vec<SpanData>,
    timeout: Duration,
) -> TraceResult<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let export = exporter.export(batch);
    let deadline = futures_timer::Delay::new(timeout);
    match block_on(future::select(export, deadline)) {
        Either::Left((result, _)) => result,
        Either::Right(((), _)) => Err(TraceError::ExportTimedOut(timeout)),
    }
}

/// Builder for [`BatchSpanProcessor`].
#[derive(Debug)]
pub struct BatchSpanProcessorBuilder<E>
where
    E: SpanExporter + 'static,
{
    exporter: E,
    config: BatchConfig,
}

impl<E> BatchSpanProcessorBuilder<E>
where
    E: SpanExporter + 'static,
{
    /// Set the batch configuration.
    pub fn with_batch_config(self, config: BatchConfig) -> Self {
        BatchSpanProcessorBuilder { config, ..self }
    }

    /// Build the processor, spawning its worker thread.
    pub fn build(self) -> BatchSpanProcessor {
        BatchSpanProcessor::new(self.exporter, self.config)
    }
}

/// Batching configuration. Use [`BatchConfigBuilder`] to construct.
#[derive(Clone, Debug)]
pub struct BatchConfig {
    /// Maximum number of spans buffered before new spans are dropped.
    pub(crate) max_queue_size: usize,
    /// Delay interval between two consecutive exports.
    pub(crate) scheduled_delay: Duration,
    /// Maximum number of spans exported in a single call.
    pub(crate) max_export_batch_size: usize,
    /// Maximum duration granted to a single export call.
    pub(crate) max_export_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfigBuilder::default().build()
    }
}

/// A builder for [`BatchConfig`].
///
/// Initial values come from the defaults, overridden by the
/// `TRACELINE_BSP_*` environment variables when set.
#[derive(Clone, Debug)]
pub struct BatchConfigBuilder {
    max_queue_size: usize,
    scheduled_delay: Duration,
    max_export_batch_size: usize,
    max_export_timeout: Duration,
}

impl Default for BatchConfigBuilder {
    fn default() -> Self {
        BatchConfigBuilder {
            max_queue_size: BSP_MAX_QUEUE_SIZE_DEFAULT,
            scheduled_delay: Duration::from_millis(BSP_SCHEDULE_DELAY_DEFAULT),
            max_export_batch_size: BSP_MAX_EXPORT_BATCH_SIZE_DEFAULT,
            max_export_timeout: Duration::from_millis(BSP_EXPORT_TIMEOUT_DEFAULT),
        }
        .init_from_env_vars()
    }
}

impl BatchConfigBuilder {
    /// Set the maximum queue size; spans beyond it are dropped. The default
    /// is 2048.
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Set the maximum number of spans exported per batch. The default is
    /// 512; values above the queue size are clamped to it.
    pub fn with_max_export_batch_size(mut self, max_export_batch_size: usize) -> Self {
        self.max_export_batch_size = max_export_batch_size;
        self
    }

    /// Set the delay between two consecutive batch exports. The default is
    /// 5 seconds.
    pub fn with_scheduled_delay(mut self, scheduled_delay: Duration) -> Self {
        self.scheduled_delay = scheduled_delay;
        self
    }

    /// Set the maximum duration granted to a single export call. The
    /// default is 30 seconds.
    pub fn with_max_export_timeout(mut self, max_export_timeout: Duration) -> Self {
        self.max_export_timeout = max_export_timeout;
        self
    }

    /// Build a `BatchConfig`, clamping the batch size to the queue size.
    pub fn build(self) -> BatchConfig {
        let max_export_batch_size = min(self.max_export_batch_size, self.max_queue_size);

        BatchConfig {
            max_queue_size: self.max_queue_size,
            scheduled_delay: self.scheduled_delay,
            max_export_timeout: self.max_export_timeout,
            max_export_batch_size,
        }
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Some(max_queue_size) = env::var(BSP_MAX_QUEUE_SIZE)
            .ok()
            .and_then(|queue_size| usize::from_str(&queue_size).ok())
        {
            self.max_queue_size = max_queue_size;
        }

        if let Some(scheduled_delay) = env::var(BSP_SCHEDULE_DELAY)
            .ok()
            .and_then(|delay| u64::from_str(&delay).ok())
        {
            self.scheduled_delay = Duration::from_millis(scheduled_delay);
        }

        if let Some(max_export_batch_size) = env::var(BSP_MAX_EXPORT_BATCH_SIZE)
            .ok()
            .and_then(|batch_size| usize::from_str(&batch_size).ok())
        {
            self.max_export_batch_size = max_export_batch_size;
        }

        if let Some(max_export_timeout) = env::var(BSP_EXPORT_TIMEOUT)
            .ok()
            .and_then(|timeout| u64::from_str(&timeout).ok())
        {
            self.max_export_timeout = Duration::from_millis(max_export_timeout);
        }

        self
    }
}
