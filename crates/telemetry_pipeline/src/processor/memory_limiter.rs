//! Memory limiter - bounds the number of records buffered downstream.
//!
//! Each admitted record carries a lease on the limiter's gauge, so usage
//! falls as records are exported, sampled out or otherwise dropped
//! anywhere after this stage.

use super::{Emitter, Processor, ProcessorContext};
use crate::batch::Batch;
use crate::error::{ProcessorError, ResourceExhaustion};
use crate::usage::{LeaseAttacher, UsageGauge};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// Forward what fits and wait for usage to fall.
    Block,
    /// Refuse what does not fit.
    Drop,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryLimiterSettings {
    pub limit: u64,
    pub release_threshold: u64,
    pub backpressure: Backpressure,
}

impl MemoryLimiterSettings {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.limit == 0 {
            return Err("limit must be at least 1".into());
        }
        if self.release_threshold >= self.limit {
            return Err(format!(
                "release_threshold ({}) must be below limit ({})",
                self.release_threshold, self.limit
            ));
        }
        Ok(())
    }
}

pub struct MemoryLimiter {
    gauge: Arc<UsageGauge>,
    backpressure: Backpressure,
    ctx: ProcessorContext,
    refusing: bool,
}

impl MemoryLimiter {
    pub fn new(settings: &MemoryLimiterSettings, ctx: ProcessorContext) -> Self {
        Self {
            gauge: UsageGauge::bounded(settings.limit, settings.release_threshold),
            backpressure: settings.backpressure,
            ctx,
            refusing: false,
        }
    }

    pub fn gauge(&self) -> &Arc<UsageGauge> {
        &self.gauge
    }

    fn enter_refusing(&mut self) {
        if !self.refusing {
            self.refusing = true;
            tracing::warn!(
                pipeline = %self.ctx.pipeline,
                component = %self.ctx.id,
                usage = self.gauge.usage(),
                limit = self.gauge.limit().unwrap_or_default(),
                "memory limit reached; refusing records"
            );
        }
    }

    fn note_recovery(&mut self) {
        if self.refusing && !self.gauge.is_tripped() {
            self.refusing = false;
            tracing::info!(
                pipeline = %self.ctx.pipeline,
                component = %self.ctx.id,
                usage = self.gauge.usage(),
                "memory usage below release threshold; admitting records"
            );
        }
    }
}

impl Processor for MemoryLimiter {
    async fn process(&mut self, batch: Batch, out: &mut Emitter) -> Result<(), ProcessorError> {
        let Batch {
            records,
            route,
            sequence,
            pipeline,
        } = batch;
        let mut remaining = records.into_iter().peekable();

        while remaining.peek().is_some() {
            self.note_recovery();
            let mut attacher = LeaseAttacher::new(&self.gauge);
            let mut admitted = Vec::new();
            while let Some(mut record) = remaining.next_if(|_| self.gauge.try_admit()) {
                attacher.attach(&mut record.lease);
                admitted.push(record);
            }
            out.emit(Batch {
                records: admitted,
                route: route.clone(),
                sequence,
                pipeline: Arc::clone(&pipeline),
            })
            .await?;

            if remaining.peek().is_none() {
                break;
            }
            self.enter_refusing();
            match self.backpressure {
                Backpressure::Drop => {
                    let refused = remaining.count() as u64;
                    self.ctx.metrics.record_refused(refused);
                    let signal = ResourceExhaustion::MemoryLimit {
                        usage: self.gauge.usage(),
                        limit: self.gauge.limit().unwrap_or_default(),
                    };
                    tracing::debug!(
                        pipeline = %self.ctx.pipeline,
                        component = %self.ctx.id,
                        refused,
                        reason = %signal,
                        "records refused"
                    );
                    self.ctx.health.record_error(signal);
                    break;
                }
                Backpressure::Block => {
                    tokio::select! {
                        _ = self.gauge.wait_released() => {}
                        _ = self.ctx.cancel.cancelled() => return Err(ProcessorError::Cancelled),
                    }
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory_limiter"
    }
}
