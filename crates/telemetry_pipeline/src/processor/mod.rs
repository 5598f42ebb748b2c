//! Processor stages.
//!
//! Every processor of a pipeline runs as its own task, connected to its
//! neighbours by bounded channels. A stage owns its processor exclusively,
//! so processors are plain `&mut self` state machines with no locking.
//!
//! Uses native async fn in traits (Rust 2024 edition); [`ProcessorBoxed`]
//! is the object-safe twin used by the stage runner.

pub mod attributes;
pub mod batch;
pub mod filter;
pub mod memory_limiter;
pub mod routing;
pub mod tail_sampling;

use crate::batch::Batch;
use crate::component::ComponentId;
use crate::config::{parse_options, Options};
use crate::error::ProcessorError;
use crate::metrics::{ComponentHealth, PipelineMetrics};
use crate::record::SignalType;
use crate::registry::SettingsError;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use attributes::{AttributesProcessor, AttributesSettings};
pub use batch::{BatchProcessor, BatchSettings};
pub use filter::{FilterProcessor, FilterSettings, Predicate};
pub use memory_limiter::{Backpressure, MemoryLimiter, MemoryLimiterSettings};
pub use routing::{RoutingProcessor, RoutingSettings};
pub use tail_sampling::{TailSamplingProcessor, TailSamplingSettings};

/// Output side of a stage.
pub struct Emitter {
    tx: mpsc::Sender<Batch>,
    emitted: u64,
}

impl Emitter {
    pub fn new(tx: mpsc::Sender<Batch>) -> Self {
        Self { tx, emitted: 0 }
    }

    /// Sends `batch` downstream, waiting for channel capacity. Empty batches
    /// are discarded.
    pub async fn emit(&mut self, batch: Batch) -> Result<(), ProcessorError> {
        if batch.is_empty() {
            return Ok(());
        }
        let len = batch.len() as u64;
        self.tx
            .send(batch)
            .await
            .map_err(|_| ProcessorError::DownstreamClosed)?;
        self.emitted += len;
        Ok(())
    }

    /// Records emitted so far.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

/// What a processor instance knows about where it runs.
#[derive(Clone)]
pub struct ProcessorContext {
    pub id: ComponentId,
    pub pipeline: Arc<str>,
    pub metrics: Arc<PipelineMetrics>,
    pub health: Arc<ComponentHealth>,
    /// Fires on forced stop.
    pub cancel: CancellationToken,
}

/// A stage of the processor chain.
pub trait Processor: Send {
    /// Handles one input batch, emitting zero or more batches.
    fn process(
        &mut self,
        batch: Batch,
        out: &mut Emitter,
    ) -> impl Future<Output = Result<(), ProcessorError>> + Send;

    /// Earliest instant at which [`Processor::on_deadline`] must run.
    fn next_deadline(&self) -> Option<Instant> {
        None
    }

    fn on_deadline(
        &mut self,
        _now: Instant,
        _out: &mut Emitter,
    ) -> impl Future<Output = Result<(), ProcessorError>> + Send {
        async { Ok(()) }
    }

    /// Emits everything still held. Called once, after the input closes.
    fn drain(&mut self, _out: &mut Emitter) -> impl Future<Output = Result<(), ProcessorError>> + Send {
        async { Ok(()) }
    }

    fn name(&self) -> &str;
}

type StageFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ProcessorError>> + Send + 'a>>;

/// Object-safe version of [`Processor`].
pub trait ProcessorBoxed: Send {
    fn process_boxed<'a>(&'a mut self, batch: Batch, out: &'a mut Emitter) -> StageFuture<'a>;

    fn next_deadline(&self) -> Option<Instant>;

    fn on_deadline_boxed<'a>(&'a mut self, now: Instant, out: &'a mut Emitter) -> StageFuture<'a>;

    fn drain_boxed<'a>(&'a mut self, out: &'a mut Emitter) -> StageFuture<'a>;

    fn name(&self) -> &str;
}

impl<T: Processor> ProcessorBoxed for T {
    fn process_boxed<'a>(&'a mut self, batch: Batch, out: &'a mut Emitter) -> StageFuture<'a> {
        Box::pin(self.process(batch, out))
    }

    fn next_deadline(&self) -> Option<Instant> {
        Processor::next_deadline(self)
    }

    fn on_deadline_boxed<'a>(&'a mut self, now: Instant, out: &'a mut Emitter) -> StageFuture<'a> {
        Box::pin(self.on_deadline(now, out))
    }

    fn drain_boxed<'a>(&'a mut self, out: &'a mut Emitter) -> StageFuture<'a> {
        Box::pin(self.drain(out))
    }

    fn name(&self) -> &str {
        Processor::name(self)
    }
}

/// Typed options of every built-in processor.
#[derive(Debug, Clone)]
pub enum ProcessorSettings {
    Batch(BatchSettings),
    MemoryLimiter(MemoryLimiterSettings),
    Attributes(AttributesSettings),
    Filter(FilterSettings),
    Routing(RoutingSettings),
    TailSampling(TailSamplingSettings),
}

impl ProcessorSettings {
    pub fn parse(kind: &str, options: &Options) -> Result<Self, SettingsError> {
        let settings = match kind {
            "batch" => Self::Batch(parse_options(options)?),
            "memory_limiter" => Self::MemoryLimiter(parse_options(options)?),
            "attributes" => Self::Attributes(parse_options(options)?),
            "filter" => Self::Filter(parse_options(options)?),
            "routing" => Self::Routing(parse_options(options)?),
            "tail_sampling" => Self::TailSampling(parse_options(options)?),
            _ => return Err(SettingsError::UnknownType),
        };
        settings.validate().map_err(SettingsError::Invalid)?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Self::Batch(s) => s.validate(),
            Self::MemoryLimiter(s) => s.validate(),
            Self::Attributes(s) => s.validate(),
            Self::Filter(s) => s.validate(),
            Self::Routing(s) => s.validate(),
            Self::TailSampling(s) => s.validate(),
        }
    }

    pub fn supports(&self, signal: SignalType) -> bool {
        match self {
            Self::TailSampling(_) => signal == SignalType::Traces,
            _ => true,
        }
    }

    pub fn build(&self, ctx: ProcessorContext) -> Result<Box<dyn ProcessorBoxed>, String> {
        Ok(match self {
            Self::Batch(s) => Box::new(BatchProcessor::new(s.clone(), ctx)),
            Self::MemoryLimiter(s) => Box::new(MemoryLimiter::new(s, ctx)),
            Self::Attributes(s) => Box::new(AttributesProcessor::new(s, ctx)?),
            Self::Filter(s) => Box::new(FilterProcessor::new(s, ctx)?),
            Self::Routing(s) => Box::new(RoutingProcessor::new(s, ctx)),
            Self::TailSampling(s) => Box::new(TailSamplingProcessor::new(s.clone(), ctx)),
        })
    }
}

async fn closed(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Runs `fut` to completion unless the stage is force-stopped first.
async fn guarded(
    ctx: &ProcessorContext,
    fut: StageFuture<'_>,
) -> Result<(), ProcessorError> {
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(ProcessorError::Cancelled),
        outcome = AssertUnwindSafe(fut).catch_unwind() => match outcome {
            Ok(result) => result,
            Err(_) => Err(ProcessorError::Panicked { processor: ctx.id.to_string() }),
        },
    }
}

fn report(ctx: &ProcessorContext, stage: &str, error: &ProcessorError, lost: u64) {
    if matches!(error, ProcessorError::Cancelled) {
        return;
    }
    if lost > 0 {
        ctx.metrics.record_dropped(lost);
    }
    tracing::warn!(
        pipeline = %ctx.pipeline,
        component = %ctx.id,
        stage,
        records = lost,
        error = %error,
        "processor failed; batch dropped"
    );
    ctx.health.record_error(error);
}

/// Drives one processor until its input is closed and drained, or until
/// forced stop.
///
/// When `close_input` is given (first consumer of the intake queue), firing
/// it closes the input so producers are refused while buffered batches are
/// still processed.
pub(crate) async fn run_stage(
    mut processor: Box<dyn ProcessorBoxed>,
    mut input: mpsc::Receiver<Batch>,
    output: mpsc::Sender<Batch>,
    ctx: ProcessorContext,
    close_input: Option<CancellationToken>,
) {
    let mut out = Emitter::new(output);
    let mut input_closed = false;

    loop {
        let deadline = processor.next_deadline();
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return,
            _ = closed(close_input.as_ref()), if !input_closed => {
                input.close();
                input_closed = true;
            }
            next = input.recv() => match next {
                Some(batch) => {
                    let len = batch.len() as u64;
                    let before = out.emitted();
                    if let Err(e) = guarded(&ctx, processor.process_boxed(batch, &mut out)).await {
                        let lost = len.saturating_sub(out.emitted() - before);
                        report(&ctx, "process", &e, lost);
                        if matches!(e, ProcessorError::DownstreamClosed | ProcessorError::Cancelled) {
                            return;
                        }
                    }
                }
                None => break,
            },
            _ = sleep_until(deadline), if deadline.is_some() => {
                if let Err(e) = guarded(&ctx, processor.on_deadline_boxed(Instant::now(), &mut out)).await {
                    report(&ctx, "deadline", &e, 0);
                    if matches!(e, ProcessorError::DownstreamClosed | ProcessorError::Cancelled) {
                        return;
                    }
                }
            }
        }
    }

    if let Err(e) = guarded(&ctx, processor.drain_boxed(&mut out)).await {
        report(&ctx, "drain", &e, 0);
    }
    tracing::debug!(pipeline = %ctx.pipeline, component = %ctx.id, "stage drained");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::component::Section;
    use crate::record::{
        InstrumentationScope, LogEntry, Record, RecordBody, Resource, Severity, SpanData, SpanId,
        SpanStatus, TraceId,
    };

    pub fn context(id: &str) -> ProcessorContext {
        let id: ComponentId = id.parse().unwrap();
        ProcessorContext {
            health: ComponentHealth::for_component(Section::Processor, &id, Some("test")),
            id,
            pipeline: Arc::from("test"),
            metrics: PipelineMetrics::new(Arc::from("test")),
            cancel: CancellationToken::new(),
        }
    }

    pub fn log(body: &str) -> Record {
        Record::new(
            Arc::new(Resource::from_pairs([("service.name", "checkout")])),
            Arc::new(InstrumentationScope::default()),
            1,
            RecordBody::Log(LogEntry {
                severity: Severity::Info,
                body: body.to_string(),
                trace_id: None,
                span_id: None,
            }),
        )
    }

    pub fn span(trace: u8, id: u8, status: SpanStatus, start: u64, end: u64) -> Record {
        Record::new(
            Arc::new(Resource::default()),
            Arc::new(InstrumentationScope::default()),
            start,
            RecordBody::Span(SpanData {
                trace_id: TraceId([trace; 16]),
                span_id: SpanId([id; 8]),
                parent_span_id: None,
                name: format!("span-{id}"),
                kind: Default::default(),
                status,
                end_time_unix_nano: end,
            }),
        )
    }

    pub fn drain_channel(rx: &mut mpsc::Receiver<Batch>) -> Vec<Batch> {
        let mut batches = Vec::new();
        while let Ok(batch) = rx.try_recv() {
            batches.push(batch);
        }
        batches
    }
}
