//! Batch processor - size/time bounded accumulation.
//!
//! The accumulation core is pure: no channels, no atomics, time passed in
//! by the caller. [`BatchProcessor`] wires it into the stage runner.
//!
//! Records are accumulated per route so a flush never mixes exporter
//! subsets. `max_batch_size` is a hard ceiling: a group that reaches it is
//! emitted immediately, in the middle of an input batch if necessary.

use super::{Emitter, Processor, ProcessorContext};
use crate::batch::{Batch, Route};
use crate::error::ProcessorError;
use crate::record::Record;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchSettings {
    /// Maximum number of records per batch
    pub max_batch_size: usize,
    /// Maximum time the oldest held record waits before a flush
    #[serde(with = "crate::config::duration")]
    pub flush_interval: Duration,
}

impl BatchSettings {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.max_batch_size == 0 {
            return Err("max_batch_size must be at least 1".into());
        }
        if self.flush_interval.is_zero() {
            return Err("flush_interval must be positive".into());
        }
        Ok(())
    }
}

/// Flush counters (plain u64, owned by the stage task)
#[derive(Debug, Default, Clone)]
pub struct BatchMetrics {
    pub batches_flushed: u64,
    pub records_flushed: u64,
    /// Flushes caused by reaching `max_batch_size`
    pub size_triggered: u64,
    /// Flushes caused by `flush_interval`
    pub timer_triggered: u64,
}

struct Pending {
    route: Route,
    records: Vec<Record>,
    oldest: Instant,
}

/// Pure accumulation state.
pub struct BatchAccumulator {
    pending: Vec<Pending>,
    settings: BatchSettings,
    metrics: BatchMetrics,
}

impl BatchAccumulator {
    pub fn new(settings: BatchSettings) -> Self {
        Self {
            pending: Vec::new(),
            settings,
            metrics: BatchMetrics::default(),
        }
    }

    /// Adds a record; returns the full batch when its group reaches the
    /// ceiling.
    pub fn add(&mut self, record: Record, route: &Route, now: Instant) -> Option<Batch> {
        let index = match self.pending.iter().position(|p| &p.route == route) {
            Some(index) => index,
            None => {
                self.pending.push(Pending {
                    route: route.clone(),
                    records: Vec::with_capacity(self.settings.max_batch_size.min(1024)),
                    oldest: now,
                });
                self.pending.len() - 1
            }
        };
        self.pending[index].records.push(record);

        if self.pending[index].records.len() >= self.settings.max_batch_size {
            let group = self.pending.swap_remove(index);
            self.metrics.size_triggered += 1;
            return Some(self.flushed(group));
        }
        None
    }

    pub fn total_pending(&self) -> usize {
        self.pending.iter().map(|p| p.records.len()).sum()
    }

    /// When the oldest held record reaches `flush_interval`.
    pub fn next_flush(&self) -> Option<Instant> {
        self.pending
            .iter()
            .map(|p| p.oldest + self.settings.flush_interval)
            .min()
    }

    /// Removes every group whose oldest record has waited `flush_interval`.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Batch> {
        let interval = self.settings.flush_interval;
        let mut expired = Vec::new();
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].oldest + interval <= now {
                expired.push(self.pending.remove(i));
            } else {
                i += 1;
            }
        }
        expired.sort_by_key(|p| p.oldest);
        self.metrics.timer_triggered += expired.len() as u64;
        expired.into_iter().map(|p| self.flushed(p)).collect()
    }

    /// Removes every group, oldest first.
    pub fn take_all(&mut self) -> Vec<Batch> {
        let mut all: Vec<Pending> = self.pending.drain(..).collect();
        all.sort_by_key(|p| p.oldest);
        all.into_iter().map(|p| self.flushed(p)).collect()
    }

    fn flushed(&mut self, group: Pending) -> Batch {
        self.metrics.batches_flushed += 1;
        self.metrics.records_flushed += group.records.len() as u64;
        Batch::routed(group.records, group.route)
    }

    pub fn metrics(&self) -> &BatchMetrics {
        &self.metrics
    }
}

pub struct BatchProcessor {
    accumulator: BatchAccumulator,
    ctx: ProcessorContext,
}

impl BatchProcessor {
    pub fn new(settings: BatchSettings, ctx: ProcessorContext) -> Self {
        Self {
            accumulator: BatchAccumulator::new(settings),
            ctx,
        }
    }
}

impl Processor for BatchProcessor {
    async fn process(&mut self, batch: Batch, out: &mut Emitter) -> Result<(), ProcessorError> {
        let now = Instant::now();
        let route = batch.route;
        for record in batch.records {
            if let Some(full) = self.accumulator.add(record, &route, now) {
                out.emit(full).await?;
            }
        }
        Ok(())
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.accumulator.next_flush()
    }

    async fn on_deadline(&mut self, now: Instant, out: &mut Emitter) -> Result<(), ProcessorError> {
        for batch in self.accumulator.take_expired(now) {
            out.emit(batch).await?;
        }
        Ok(())
    }

    async fn drain(&mut self, out: &mut Emitter) -> Result<(), ProcessorError> {
        for batch in self.accumulator.take_all() {
            out.emit(batch).await?;
        }
        let metrics = self.accumulator.metrics();
        tracing::debug!(
            pipeline = %self.ctx.pipeline,
            component = %self.ctx.id,
            batches = metrics.batches_flushed,
            records = metrics.records_flushed,
            size_triggered = metrics.size_triggered,
            timer_triggered = metrics.timer_triggered,
            "batch processor drained"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "batch"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::test_util::*;
    use crate::processor::{run_stage, ProcessorBoxed};
    use proptest::prelude::*;
    use tokio::sync::mpsc;

    fn settings(max_batch_size: usize, flush_ms: u64) -> BatchSettings {
        BatchSettings {
            max_batch_size,
            flush_interval: Duration::from_millis(flush_ms),
        }
    }

    #[test]
    fn test_ceiling_splits_large_input() {
        let mut acc = BatchAccumulator::new(settings(5, 1000));
        let now = Instant::now();
        let full: Vec<Batch> = (0..12)
            .filter_map(|i| acc.add(log(&i.to_string()), &Route::default(), now))
            .collect();
        assert_eq!(full.len(), 2);
        assert!(full.iter().all(|b| b.len() == 5));
        assert_eq!(acc.total_pending(), 2);
        assert_eq!(acc.metrics().size_triggered, 2);
    }

    #[test]
    fn test_routes_accumulate_separately() {
        let mut acc = BatchAccumulator::new(settings(10, 1000));
        let now = Instant::now();
        let errors = Route::to(vec!["file/errors".parse().unwrap()]);
        acc.add(log("a"), &Route::default(), now);
        acc.add(log("b"), &errors, now);
        acc.add(log("c"), &Route::default(), now);

        let batches = acc.take_all();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert!(batches[0].route.is_default());
        assert_eq!(batches[1].route, errors);
    }

    #[test]
    fn test_take_expired_uses_oldest_record() {
        let mut acc = BatchAccumulator::new(settings(10, 100));
        let start = Instant::now();
        acc.add(log("a"), &Route::default(), start);
        acc.add(log("b"), &Route::default(), start + Duration::from_millis(90));
        assert_eq!(acc.next_flush(), Some(start + Duration::from_millis(100)));

        assert!(acc.take_expired(start + Duration::from_millis(99)).is_empty());
        let flushed = acc.take_expired(start + Duration::from_millis(100));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].len(), 2);
        assert_eq!(acc.next_flush(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_within_interval_under_paused_clock() {
        let ctx = context("batch");
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let processor: Box<dyn ProcessorBoxed> = Box::new(BatchProcessor::new(settings(100, 200), ctx.clone()));
        let stage = tokio::spawn(run_stage(processor, in_rx, out_tx, ctx, None));

        let sent_at = Instant::now();
        in_tx.send(Batch::new(vec![log("a"), log("b")])).await.unwrap();

        let batch = out_rx.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(sent_at.elapsed() >= Duration::from_millis(200));
        assert!(sent_at.elapsed() < Duration::from_millis(250));

        drop(in_tx);
        stage.await.unwrap();
        assert!(out_rx.recv().await.is_none());
    }

    proptest! {
        #[test]
        fn prop_every_batch_respects_ceiling(
            max in 1usize..20,
            inputs in proptest::collection::vec(0usize..50, 1..20),
        ) {
            let mut acc = BatchAccumulator::new(settings(max, 1000));
            let now = Instant::now();
            let mut emitted = Vec::new();
            let mut total = 0;
            for size in inputs {
                total += size;
                for i in 0..size {
                    if let Some(batch) = acc.add(log(&i.to_string()), &Route::default(), now) {
                        emitted.push(batch);
                    }
                }
            }
            emitted.extend(acc.take_all());
            prop_assert!(emitted.iter().all(|b| !b.is_empty() && b.len() <= max));
            prop_assert_eq!(emitted.iter().map(Batch::len).sum::<usize>(), total);
        }
    }
}
