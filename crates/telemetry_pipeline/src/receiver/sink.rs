//! Receiver side of a pipeline's intake queue.
//!
//! Receivers never hold a pipeline directly; they hold a [`Producer`], which
//! wraps any [`RecordSink`]. A producer that is not wired to a pipeline
//! falls back to [`NullSink`].

use crate::batch::Batch;
use crate::error::{ResourceExhaustion, SinkError};
use crate::metrics::PipelineMetrics;
use crate::usage::LeaseAttacher;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Accepts decoded batches on behalf of a pipeline.
pub trait RecordSink: Send + Sync {
    fn accept(&self, batch: Batch) -> impl Future<Output = Result<(), SinkError>> + Send;
}

type AcceptFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;

/// Object-safe version of [`RecordSink`].
pub trait RecordSinkBoxed: Send + Sync {
    fn accept_boxed(&self, batch: Batch) -> AcceptFuture<'_>;
}

impl<T: RecordSink> RecordSinkBoxed for T {
    fn accept_boxed(&self, batch: Batch) -> AcceptFuture<'_> {
        Box::pin(self.accept(batch))
    }
}

/// Sink that accepts everything and keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl RecordSink for NullSink {
    async fn accept(&self, _batch: Batch) -> Result<(), SinkError> {
        Ok(())
    }
}

/// What a full intake queue does to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Wait for room.
    Block,
    /// Refuse the batch.
    Drop,
}

/// Feeds one pipeline's intake queue.
///
/// Every accepted record is leased against the pipeline's in-flight gauge,
/// so records still held anywhere in the pipeline can be counted at forced
/// stop.
pub struct PipelineSink {
    tx: mpsc::Sender<Batch>,
    metrics: Arc<PipelineMetrics>,
    admission: Admission,
}

impl PipelineSink {
    pub fn new(tx: mpsc::Sender<Batch>, metrics: Arc<PipelineMetrics>, admission: Admission) -> Self {
        Self {
            tx,
            metrics,
            admission,
        }
    }
}

impl RecordSink for PipelineSink {
    async fn accept(&self, mut batch: Batch) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }
        let records = batch.len() as u64;
        batch.pipeline = Arc::clone(self.metrics.name());

        let gauge = self.metrics.in_flight();
        gauge.add(records);
        let mut attacher = LeaseAttacher::new(gauge);
        for record in &mut batch.records {
            attacher.attach(&mut record.lease);
        }

        let outcome = match self.admission {
            Admission::Block => self.tx.send(batch).await.map_err(|_| SinkError::Closed),
            Admission::Drop => self.tx.try_send(batch).map_err(|e| match e {
                TrySendError::Full(_) => SinkError::Exhausted(ResourceExhaustion::QueueFull {
                    pipeline: self.metrics.name().to_string(),
                }),
                TrySendError::Closed(_) => SinkError::Closed,
            }),
        };
        match outcome {
            Ok(()) => self.metrics.record_received(records),
            Err(_) => self.metrics.record_refused(records),
        }
        outcome
    }
}

/// Cloneable handle to a sink.
#[derive(Clone)]
pub struct Producer {
    sink: Arc<dyn RecordSinkBoxed>,
}

impl Producer {
    pub fn new(sink: impl RecordSink + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    pub async fn send(&self, batch: Batch) -> Result<(), SinkError> {
        self.sink.accept_boxed(batch).await
    }
}

impl Default for Producer {
    fn default() -> Self {
        Self::new(NullSink)
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Producer")
    }
}
