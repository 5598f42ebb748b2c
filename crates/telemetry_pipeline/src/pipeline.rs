//! Pipeline wiring.
//!
//! ```text
//! receivers ──► intake(queue_size) ──► stage 1 ──► … ──► stage N ──► fan-out ──► exporter queues
//! ```
//!
//! The intake queue is the only synchronization point between receivers
//! and the chain. Stages are connected by channels of the same capacity.
//! The fan-out stamps each batch with the pipeline's next sequence number
//! and hands one shared copy to every exporter on the batch's route.

use crate::batch::Batch;
use crate::component::{ComponentId, ComponentState, Section};
use crate::exporter::ExportRequest;
use crate::metrics::{ComponentHealth, PipelineMetrics};
use crate::processor::{run_stage, Backpressure, ProcessorContext, ProcessorSettings};
use crate::receiver::{Admission, PipelineSink, Producer};
use crate::registry::{PipelineSpec, Registry};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// One exporter queue reachable from a pipeline.
#[derive(Clone)]
pub(crate) struct ExportTarget {
    pub id: ComponentId,
    pub queue: mpsc::Sender<ExportRequest>,
}

/// How a full intake queue treats receivers: refusing when the pipeline
/// runs a dropping memory limiter, waiting otherwise.
fn admission(registry: &Registry, spec: &PipelineSpec) -> Admission {
    let drops = spec.processors.iter().any(|&p| {
        matches!(
            &registry.processor(p).settings,
            ProcessorSettings::MemoryLimiter(s) if s.backpressure == Backpressure::Drop
        )
    });
    if drops { Admission::Drop } else { Admission::Block }
}

/// A started pipeline: its intake handle and component health records.
pub(crate) struct RunningPipeline {
    pub producer: Producer,
    pub health: Vec<Arc<ComponentHealth>>,
}

/// Spawns every stage of `spec` plus its fan-out onto `tasks`.
///
/// `close` closes the intake (receivers are refused from then on, buffered
/// batches still flow); `force` aborts every stage.
pub(crate) fn spawn(
    registry: &Registry,
    spec: &PipelineSpec,
    metrics: &Arc<PipelineMetrics>,
    targets: Vec<ExportTarget>,
    close: &CancellationToken,
    force: &CancellationToken,
    tasks: &mut JoinSet<()>,
) -> Result<RunningPipeline, (ComponentId, String)> {
    let (intake_tx, mut input) = mpsc::channel::<Batch>(spec.queue_size);
    let producer = Producer::new(PipelineSink::new(
        intake_tx,
        Arc::clone(metrics),
        admission(registry, spec),
    ));

    let mut health = Vec::with_capacity(spec.processors.len());
    let mut close_input = Some(close.clone());
    for &idx in &spec.processors {
        let node = registry.processor(idx);
        let stage_health = ComponentHealth::for_component(Section::Processor, &node.id, Some(&spec.name));
        let ctx = ProcessorContext {
            id: node.id.clone(),
            pipeline: Arc::clone(&spec.name),
            metrics: Arc::clone(metrics),
            health: Arc::clone(&stage_health),
            cancel: force.clone(),
        };
        let processor = node.settings.build(ctx.clone()).map_err(|e| (node.id.clone(), e))?;
        let (tx, next) = mpsc::channel::<Batch>(spec.queue_size);
        stage_health.advance(ComponentState::Started);
        tasks.spawn(run_stage(processor, input, tx, ctx, close_input.take()));
        health.push(stage_health);
        input = next;
    }

    tasks.spawn(run_fanout(
        input,
        targets,
        Arc::clone(metrics),
        close_input,
        force.clone(),
    ));
    tracing::info!(
        pipeline = %spec.name,
        signal = %spec.signal,
        stages = spec.processors.len(),
        exporters = spec.exporters.len(),
        "pipeline started"
    );
    Ok(RunningPipeline { producer, health })
}

/// Last task of a pipeline: sequences batches and copies them to exporters.
///
/// A full exporter queue loses the batch for that exporter only.
pub(crate) async fn run_fanout(
    mut input: mpsc::Receiver<Batch>,
    targets: Vec<ExportTarget>,
    metrics: Arc<PipelineMetrics>,
    close_input: Option<CancellationToken>,
    force: CancellationToken,
) {
    let mut sequence = 0u64;
    let mut input_closed = close_input.is_none();
    let close_input = close_input.unwrap_or_default();

    loop {
        let next = tokio::select! {
            biased;
            _ = force.cancelled() => return,
            _ = close_input.cancelled(), if !input_closed => {
                input.close();
                input_closed = true;
                continue;
            }
            next = input.recv() => next,
        };
        let Some(mut batch) = next else { break };
        if batch.is_empty() {
            continue;
        }
        sequence += 1;
        batch.sequence = sequence;
        batch.pipeline = Arc::clone(metrics.name());
        let records = batch.len() as u64;
        metrics.record_processed(records);

        let batch = Arc::new(batch);
        for target in targets.iter().filter(|t| batch.route.includes(&t.id)) {
            let request = ExportRequest {
                batch: Arc::clone(&batch),
                origin: Arc::clone(&metrics),
            };
            if let Err(e) = target.queue.try_send(request) {
                let reason = match e {
                    TrySendError::Full(_) => "queue full",
                    TrySendError::Closed(_) => "exporter stopped",
                };
                metrics.record_lost(records);
                tracing::warn!(
                    pipeline = %metrics.name(),
                    exporter = %target.id,
                    sequence,
                    records,
                    reason,
                    "batch dropped for exporter"
                );
            }
        }
    }
    tracing::debug!(pipeline = %metrics.name(), batches = sequence, "fan-out drained");
}
