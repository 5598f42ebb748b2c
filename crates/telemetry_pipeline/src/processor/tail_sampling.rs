//! Tail sampling - buffers spans per trace and decides once the trace is
//! complete.
//!
//! A trace is complete when it has been idle for `decision_wait`, or when a
//! span carrying `completion_attribute = true` arrives. Completed traces are
//! evaluated against the ordered policy list: the first matching policy
//! keeps the trace, no match drops it. Traces older than `max_trace_age`,
//! and the oldest trace when `max_traces` is exceeded, are force-evicted
//! with a drop decision.
//!
//! ```text
//!  span ──► decided? ──yes──► apply cached decision
//!              │no
//!              ▼
//!          TraceBuffer ──idle / completion / drain──► policies ──► keep | drop
//!              │
//!              └──max age / capacity──► drop
//! ```

use super::{Emitter, Processor, ProcessorContext};
use crate::batch::{Batch, Route};
use crate::error::ProcessorError;
use crate::record::{AttributeValue, Record, SpanStatus, TraceId};
use indexmap::IndexMap;
use serde::Deserialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

fn default_status_codes() -> Vec<SpanStatus> {
    vec![SpanStatus::Error]
}

/// Sampling policy, evaluated in configuration order.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Policy {
    /// Keeps traces containing a span with one of `status_codes`.
    StatusCode {
        #[serde(default = "default_status_codes")]
        status_codes: Vec<SpanStatus>,
    },
    /// Keeps traces whose end-to-end duration reaches `threshold`.
    Latency {
        #[serde(with = "crate::config::duration")]
        threshold: Duration,
    },
    /// Keeps a deterministic fraction of traces, keyed by trace id.
    Probabilistic { probability: f64 },
    /// Keeps traces where any span has `key` set to one of `values`.
    Attribute {
        key: String,
        values: Vec<AttributeValue>,
    },
    AlwaysSample,
}

impl Policy {
    fn validate(&self) -> Result<(), String> {
        match self {
            Policy::Probabilistic { probability } if !(0.0..=1.0).contains(probability) => {
                Err(format!("probability {probability} is outside [0, 1]"))
            }
            Policy::Attribute { values, .. } if values.is_empty() => {
                Err("attribute policy needs at least one value".into())
            }
            Policy::StatusCode { status_codes } if status_codes.is_empty() => {
                Err("status_code policy needs at least one status".into())
            }
            _ => Ok(()),
        }
    }

    fn matches(&self, trace_id: &TraceId, spans: &[(Route, Record)]) -> bool {
        match self {
            Policy::StatusCode { status_codes } => spans.iter().any(|(_, r)| {
                r.as_span()
                    .is_some_and(|s| status_codes.contains(&s.status))
            }),
            Policy::Latency { threshold } => {
                let start = spans.iter().map(|(_, r)| r.timestamp).min();
                let end = spans
                    .iter()
                    .filter_map(|(_, r)| r.as_span().map(|s| s.end_time_unix_nano))
                    .max();
                match (start, end) {
                    (Some(start), Some(end)) => {
                        Duration::from_nanos(end.saturating_sub(start)) >= *threshold
                    }
                    _ => false,
                }
            }
            Policy::Probabilistic { probability } if *probability >= 1.0 => true,
            Policy::Probabilistic { probability } => {
                let mut prefix = [0u8; 8];
                prefix.copy_from_slice(&trace_id.0[..8]);
                let position = u64::from_be_bytes(prefix) as f64 / u64::MAX as f64;
                position < *probability
            }
            Policy::Attribute { key, values } => spans
                .iter()
                .any(|(_, r)| r.attributes.get(key).is_some_and(|v| values.contains(v))),
            Policy::AlwaysSample => true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TailSamplingSettings {
    #[serde(with = "crate::config::duration")]
    pub decision_wait: Duration,
    #[serde(with = "crate::config::duration")]
    pub max_trace_age: Duration,
    pub policies: Vec<Policy>,
    #[serde(default)]
    pub max_traces: Option<usize>,
    #[serde(default)]
    pub completion_attribute: Option<String>,
    #[serde(default)]
    pub decision_cache_size: Option<usize>,
}

impl TailSamplingSettings {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.decision_wait.is_zero() {
            return Err("decision_wait must be positive".into());
        }
        if self.max_trace_age < self.decision_wait {
            return Err("max_trace_age must not be shorter than decision_wait".into());
        }
        if self.policies.is_empty() {
            return Err("at least one policy is required".into());
        }
        if self.max_traces == Some(0) {
            return Err("max_traces must be at least 1".into());
        }
        for (i, policy) in self.policies.iter().enumerate() {
            policy.validate().map_err(|e| format!("policies[{i}]: {e}"))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Keep,
    Drop,
}

/// Why a trace left the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    Idle,
    Completed,
    MaxAge,
    Capacity,
    Drain,
}

impl EvictReason {
    /// Forced evictions are dropped without consulting the policies.
    fn is_forced(self) -> bool {
        matches!(self, EvictReason::MaxAge | EvictReason::Capacity)
    }
}

struct TraceEntry {
    spans: Vec<(Route, Record)>,
    first_seen: Instant,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct EvictedTrace {
    pub trace_id: TraceId,
    pub spans: Vec<(Route, Record)>,
    pub reason: EvictReason,
}

/// Per-trace span buffer with idle and age deadlines.
///
/// Deadline heap entries are lazy: an entry popped before the trace's
/// current deadline is pushed again with the new one.
pub struct TraceBuffer {
    traces: HashMap<TraceId, TraceEntry>,
    deadlines: BinaryHeap<Reverse<(Instant, TraceId)>>,
    arrival: VecDeque<(Instant, TraceId)>,
    decision_wait: Duration,
    max_trace_age: Duration,
    max_traces: Option<usize>,
    completion_attribute: Option<String>,
}

impl TraceBuffer {
    pub fn new(settings: &TailSamplingSettings) -> Self {
        Self {
            traces: HashMap::new(),
            deadlines: BinaryHeap::new(),
            arrival: VecDeque::new(),
            decision_wait: settings.decision_wait,
            max_trace_age: settings.max_trace_age,
            max_traces: settings.max_traces,
            completion_attribute: settings.completion_attribute.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    fn deadline(&self, entry: &TraceEntry) -> Instant {
        (entry.last_seen + self.decision_wait).min(entry.first_seen + self.max_trace_age)
    }

    fn is_completion(&self, record: &Record) -> bool {
        self.completion_attribute.as_ref().is_some_and(|key| {
            record.attributes.get(key).and_then(AttributeValue::as_bool) == Some(true)
        })
    }

    /// Buffers a span. Returns traces that left the buffer as a result: the
    /// span's own trace when it carries the completion marker, the oldest
    /// trace when capacity is exceeded.
    pub fn add(&mut self, trace_id: TraceId, route: Route, record: Record, now: Instant) -> Vec<EvictedTrace> {
        let completes = self.is_completion(&record);
        let mut evicted = Vec::new();

        match self.traces.get_mut(&trace_id) {
            Some(entry) => {
                entry.last_seen = now;
                entry.spans.push((route, record));
            }
            None => {
                let entry = TraceEntry {
                    spans: vec![(route, record)],
                    first_seen: now,
                    last_seen: now,
                };
                self.deadlines
                    .push(Reverse((self.deadline(&entry), trace_id)));
                if self.max_traces.is_some() {
                    self.arrival.push_back((now, trace_id));
                }
                self.traces.insert(trace_id, entry);

                if let Some(max) = self.max_traces
                    && self.traces.len() > max
                    && let Some(oldest) = self.evict_oldest()
                {
                    evicted.push(oldest);
                }
            }
        }

        if completes && let Some(entry) = self.traces.remove(&trace_id) {
            evicted.push(EvictedTrace {
                trace_id,
                spans: entry.spans,
                reason: EvictReason::Completed,
            });
            self.prune_arrival();
        }
        evicted
    }

    fn is_live(&self, first_seen: Instant, trace_id: &TraceId) -> bool {
        self.traces
            .get(trace_id)
            .is_some_and(|e| e.first_seen == first_seen)
    }

    /// Drops arrival entries of traces that already left the buffer, keeping
    /// the queue within twice the number of buffered traces.
    fn prune_arrival(&mut self) {
        while let Some((first_seen, trace_id)) = self.arrival.front().copied() {
            if self.is_live(first_seen, &trace_id) {
                break;
            }
            self.arrival.pop_front();
        }
        if self.arrival.len() > 2 * self.traces.len() {
            let traces = &self.traces;
            self.arrival.retain(|(first_seen, trace_id)| {
                traces.get(trace_id).is_some_and(|e| e.first_seen == *first_seen)
            });
        }
    }

    #[cfg(test)]
    fn arrival_len(&self) -> usize {
        self.arrival.len()
    }

    fn evict_oldest(&mut self) -> Option<EvictedTrace> {
        while let Some((first_seen, trace_id)) = self.arrival.pop_front() {
            // Skip ids already evicted, or re-created after eviction.
            if self.is_live(first_seen, &trace_id)
                && let Some(entry) = self.traces.remove(&trace_id)
            {
                return Some(EvictedTrace {
                    trace_id,
                    spans: entry.spans,
                    reason: EvictReason::Capacity,
                });
            }
        }
        None
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.peek().map(|Reverse((at, _))| *at)
    }

    /// Removes every trace whose idle or age deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> Vec<EvictedTrace> {
        let mut due = Vec::new();
        while let Some(Reverse((at, trace_id))) = self.deadlines.peek().copied() {
            if at > now {
                break;
            }
            self.deadlines.pop();
            let Some(entry) = self.traces.get(&trace_id) else {
                continue;
            };
            let deadline = self.deadline(entry);
            if deadline > now {
                self.deadlines.push(Reverse((deadline, trace_id)));
                continue;
            }
            let idle_at = entry.last_seen + self.decision_wait;
            let aged_at = entry.first_seen + self.max_trace_age;
            let reason = if aged_at < idle_at {
                EvictReason::MaxAge
            } else {
                EvictReason::Idle
            };
            if let Some(entry) = self.traces.remove(&trace_id) {
                due.push(EvictedTrace {
                    trace_id,
                    spans: entry.spans,
                    reason,
                });
            }
        }
        if !due.is_empty() {
            self.prune_arrival();
        }
        due
    }

    /// Removes every buffered trace, oldest first.
    pub fn take_all(&mut self) -> Vec<EvictedTrace> {
        self.deadlines.clear();
        self.arrival.clear();
        let mut all: Vec<(Instant, EvictedTrace)> = self
            .traces
            .drain()
            .map(|(trace_id, entry)| {
                (
                    entry.first_seen,
                    EvictedTrace {
                        trace_id,
                        spans: entry.spans,
                        reason: EvictReason::Drain,
                    },
                )
            })
            .collect();
        all.sort_by_key(|(first_seen, trace)| (*first_seen, trace.trace_id));
        all.into_iter().map(|(_, trace)| trace).collect()
    }
}

/// Bounded memory of recent decisions, oldest forgotten first.
struct DecisionCache {
    decisions: HashMap<TraceId, Decision>,
    order: VecDeque<TraceId>,
    capacity: usize,
}

impl DecisionCache {
    fn new(capacity: usize) -> Self {
        Self {
            decisions: HashMap::with_capacity(capacity.min(4096)),
            order: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    fn get(&self, trace_id: &TraceId) -> Option<Decision> {
        self.decisions.get(trace_id).copied()
    }

    fn insert(&mut self, trace_id: TraceId, decision: Decision) {
        if self.capacity == 0 {
            return;
        }
        if self.decisions.insert(trace_id, decision).is_none() {
            self.order.push_back(trace_id);
            while self.order.len() > self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.decisions.remove(&oldest);
                }
            }
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SamplingStats {
    pub traces_kept: u64,
    pub traces_dropped: u64,
    pub traces_forced: u64,
    pub late_spans: u64,
}

pub struct TailSamplingProcessor {
    buffer: TraceBuffer,
    policies: Vec<Policy>,
    cache: Option<DecisionCache>,
    stats: SamplingStats,
    ctx: ProcessorContext,
}

impl TailSamplingProcessor {
    pub fn new(settings: TailSamplingSettings, ctx: ProcessorContext) -> Self {
        Self {
            buffer: TraceBuffer::new(&settings),
            cache: settings.decision_cache_size.map(DecisionCache::new),
            policies: settings.policies,
            stats: SamplingStats::default(),
            ctx,
        }
    }

    pub fn stats(&self) -> &SamplingStats {
        &self.stats
    }

    fn decide(&self, trace: &EvictedTrace) -> Decision {
        if trace.reason.is_forced() {
            return Decision::Drop;
        }
        if self
            .policies
            .iter()
            .any(|p| p.matches(&trace.trace_id, &trace.spans))
        {
            Decision::Keep
        } else {
            Decision::Drop
        }
    }

    async fn finish(&mut self, trace: EvictedTrace, out: &mut Emitter) -> Result<(), ProcessorError> {
        let decision = self.decide(&trace);
        if let Some(cache) = &mut self.cache {
            cache.insert(trace.trace_id, decision);
        }
        tracing::debug!(
            pipeline = %self.ctx.pipeline,
            trace_id = %trace.trace_id,
            spans = trace.spans.len(),
            reason = ?trace.reason,
            ?decision,
            "trace decided"
        );
        if trace.reason.is_forced() {
            self.stats.traces_forced += 1;
        }
        match decision {
            Decision::Keep => {
                self.stats.traces_kept += 1;
                emit_grouped(trace.spans, out).await
            }
            Decision::Drop => {
                self.stats.traces_dropped += 1;
                self.ctx.metrics.record_dropped(trace.spans.len() as u64);
                Ok(())
            }
        }
    }
}

/// Emits spans in arrival order, one batch per route.
async fn emit_grouped(spans: Vec<(Route, Record)>, out: &mut Emitter) -> Result<(), ProcessorError> {
    let mut groups: IndexMap<Route, Vec<Record>> = IndexMap::new();
    for (route, record) in spans {
        groups.entry(route).or_default().push(record);
    }
    for (route, records) in groups {
        out.emit(Batch::routed(records, route)).await?;
    }
    Ok(())
}

impl Processor for TailSamplingProcessor {
    async fn process(&mut self, batch: Batch, out: &mut Emitter) -> Result<(), ProcessorError> {
        if let Some(other) = batch.records.iter().find(|r| r.as_span().is_none()) {
            return Err(ProcessorError::UnsupportedSignal {
                processor: self.ctx.id.to_string(),
                signal: other.signal(),
            });
        }

        let now = Instant::now();
        let route = batch.route;
        let mut late_kept = Vec::new();
        for record in batch.records {
            let Some(trace_id) = record.as_span().map(|s| s.trace_id) else {
                continue;
            };
            match self.cache.as_ref().and_then(|c| c.get(&trace_id)) {
                Some(Decision::Keep) => {
                    self.stats.late_spans += 1;
                    late_kept.push((route.clone(), record));
                }
                Some(Decision::Drop) => {
                    self.stats.late_spans += 1;
                    self.ctx.metrics.record_dropped(1);
                }
                None => {
                    for evicted in self.buffer.add(trace_id, route.clone(), record, now) {
                        self.finish(evicted, out).await?;
                    }
                }
            }
        }
        emit_grouped(late_kept, out).await
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.buffer.next_deadline()
    }

    async fn on_deadline(&mut self, now: Instant, out: &mut Emitter) -> Result<(), ProcessorError> {
        for trace in self.buffer.take_due(now) {
            self.finish(trace, out).await?;
        }
        Ok(())
    }

    async fn drain(&mut self, out: &mut Emitter) -> Result<(), ProcessorError> {
        for trace in self.buffer.take_all() {
            self.finish(trace, out).await?;
        }
        tracing::debug!(
            pipeline = %self.ctx.pipeline,
            kept = self.stats.traces_kept,
            dropped = self.stats.traces_dropped,
            forced = self.stats.traces_forced,
            "tail sampling drained"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "tail_sampling"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::test_util::*;
    use crate::processor::{run_stage, ProcessorBoxed};
    use tokio::sync::mpsc;

    fn settings(yaml: &str) -> TailSamplingSettings {
        let settings: TailSamplingSettings = serde_yaml::from_str(yaml).unwrap();
        settings.validate().unwrap();
        settings
    }

    const ERRORS_ONLY: &str = r#"
decision_wait: 200ms
max_trace_age: 10s
policies:
  - type: status_code
"#;

    #[tokio::test(start_paused = true)]
    async fn test_error_trace_emitted_together_after_idle_timeout() {
        let ctx = context("tail_sampling");
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let processor: Box<dyn ProcessorBoxed> =
            Box::new(TailSamplingProcessor::new(settings(ERRORS_ONLY), ctx.clone()));
        let stage = tokio::spawn(run_stage(processor, in_rx, out_tx, ctx.clone(), None));

        let start = Instant::now();
        in_tx
            .send(Batch::new(vec![span(7, 1, SpanStatus::Ok, 0, 10)]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        in_tx
            .send(Batch::new(vec![span(7, 2, SpanStatus::Error, 5, 8)]))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(out_rx.try_recv().is_err(), "nothing before the trace is idle");

        let batch = out_rx.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));
        let names: Vec<&str> = batch.records.iter().map(Record::name).collect();
        assert_eq!(names, ["span-1", "span-2"]);

        // An all-ok trace is dropped.
        in_tx
            .send(Batch::new(vec![span(8, 1, SpanStatus::Ok, 0, 10)]))
            .await
            .unwrap();
        drop(in_tx);
        stage.await.unwrap();
        assert!(out_rx.recv().await.is_none());
        assert_eq!(ctx.metrics.dropped(), 1);
    }

    #[test]
    fn test_max_age_force_evicts_busy_trace() {
        let s = settings(
            "{decision_wait: 100ms, max_trace_age: 250ms, policies: [{type: always_sample}]}",
        );
        let mut buffer = TraceBuffer::new(&s);
        let start = Instant::now();
        let trace = TraceId([3; 16]);
        for i in 0..5u64 {
            let at = start + Duration::from_millis(i * 60);
            assert!(buffer.take_due(at).is_empty());
            buffer.add(trace, Route::default(), span(3, i as u8 + 1, SpanStatus::Ok, 0, 1), at);
        }
        let due = buffer.take_due(start + Duration::from_millis(250));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].reason, EvictReason::MaxAge);
        assert_eq!(due[0].spans.len(), 5);
    }

    #[test]
    fn test_capacity_evicts_oldest_and_completion_decides_early() {
        let s = settings(
            "{decision_wait: 1s, max_trace_age: 5s, max_traces: 2, completion_attribute: done, policies: [{type: always_sample}]}",
        );
        let mut buffer = TraceBuffer::new(&s);
        let now = Instant::now();
        for t in 1..=2u8 {
            assert!(buffer.add(TraceId([t; 16]), Route::default(), span(t, 1, SpanStatus::Ok, 0, 1), now).is_empty());
        }
        let evicted = buffer.add(TraceId([3; 16]), Route::default(), span(3, 1, SpanStatus::Ok, 0, 1), now);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].trace_id, TraceId([1; 16]));
        assert_eq!(evicted[0].reason, EvictReason::Capacity);

        let marker = span(2, 2, SpanStatus::Ok, 0, 1).with_attribute("done", true);
        let completed = buffer.add(TraceId([2; 16]), Route::default(), marker, now);
        assert_eq!(completed[0].reason, EvictReason::Completed);
        assert_eq!(completed[0].spans.len(), 2);
        assert_eq!(buffer.len(), 1);
    }

    fn numbered(n: u16) -> TraceId {
        let mut id = [1u8; 16];
        id[..2].copy_from_slice(&n.to_be_bytes());
        TraceId(id)
    }

    #[test]
    fn test_arrival_order_stays_bounded_across_idle_evictions() {
        for yaml in [
            "{decision_wait: 100ms, max_trace_age: 1s, policies: [{type: always_sample}]}",
            "{decision_wait: 100ms, max_trace_age: 1s, max_traces: 500, policies: [{type: always_sample}]}",
        ] {
            let mut buffer = TraceBuffer::new(&settings(yaml));
            let mut now = Instant::now();
            for round in 0..10u16 {
                for i in 0..200u16 {
                    let id = numbered(round * 200 + i);
                    buffer.add(id, Route::default(), span(1, 1, SpanStatus::Ok, 0, 1), now);
                }
                now += Duration::from_millis(150);
                assert_eq!(buffer.take_due(now).len(), 200);
                assert!(buffer.arrival_len() <= 200, "{yaml}");
            }
            assert!(buffer.is_empty());
            assert_eq!(buffer.arrival_len(), 0);
        }
    }

    #[test]
    fn test_completions_do_not_accumulate_arrival_entries() {
        let s = settings(
            "{decision_wait: 1s, max_trace_age: 5s, max_traces: 4, completion_attribute: done, policies: [{type: always_sample}]}",
        );
        let mut buffer = TraceBuffer::new(&s);
        let now = Instant::now();
        let open = numbered(u16::MAX);
        buffer.add(open, Route::default(), span(1, 1, SpanStatus::Ok, 0, 1), now);
        for n in 0..1000u16 {
            let marker = span(1, 1, SpanStatus::Ok, 0, 1).with_attribute("done", true);
            let evicted = buffer.add(numbered(n), Route::default(), marker, now);
            assert_eq!(evicted[0].reason, EvictReason::Completed);
        }
        assert_eq!(buffer.len(), 1);
        assert!(buffer.arrival_len() <= 2);
    }

    #[test]
    fn test_full_probability_keeps_every_trace() {
        let spans = vec![(Route::default(), span(1, 1, SpanStatus::Ok, 0, 1))];
        let always = Policy::Probabilistic { probability: 1.0 };
        assert!(always.matches(&TraceId([0xff; 16]), &spans));
        assert!(always.matches(&TraceId([0x01; 16]), &spans));
    }

    #[test]
    fn test_policies() {
        let spans = vec![
            (Route::default(), span(1, 1, SpanStatus::Ok, 1_000, 5_000_000).with_attribute("tenant", "acme")),
            (Route::default(), span(1, 2, SpanStatus::Unset, 2_000, 3_000)),
        ];
        let trace = TraceId([1; 16]);
        let latency = Policy::Latency { threshold: Duration::from_millis(4) };
        assert!(latency.matches(&trace, &spans));
        let latency = Policy::Latency { threshold: Duration::from_millis(5) };
        assert!(!latency.matches(&trace, &spans));

        let attribute = Policy::Attribute { key: "tenant".into(), values: vec!["acme".into()] };
        assert!(attribute.matches(&trace, &spans));
        assert!(!Policy::StatusCode { status_codes: default_status_codes() }.matches(&trace, &spans));

        assert!(!Policy::Probabilistic { probability: 0.0 }.matches(&trace, &spans));
        let half = Policy::Probabilistic { probability: 0.5 };
        assert!(half.matches(&TraceId([0x10; 16]), &spans));
        assert!(!half.matches(&TraceId([0xf0; 16]), &spans));
    }

    #[tokio::test]
    async fn test_decision_cache_applies_to_late_spans() {
        let s = settings(
            "{decision_wait: 1s, max_trace_age: 5s, completion_attribute: done, decision_cache_size: 10, policies: [{type: status_code}]}",
        );
        let ctx = context("tail_sampling");
        let mut sampler = TailSamplingProcessor::new(s, ctx.clone());
        let (tx, mut rx) = mpsc::channel(8);
        let mut out = Emitter::new(tx);

        let kept = Batch::new(vec![span(1, 1, SpanStatus::Error, 0, 1).with_attribute("done", true)]);
        sampler.process(kept, &mut out).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().len(), 1);

        let dropped = Batch::new(vec![span(2, 1, SpanStatus::Ok, 0, 1).with_attribute("done", true)]);
        sampler.process(dropped, &mut out).await.unwrap();

        let late = Batch::new(vec![span(1, 2, SpanStatus::Ok, 0, 1), span(2, 2, SpanStatus::Ok, 0, 1)]);
        sampler.process(late, &mut out).await.unwrap();
        let late_kept = rx.recv().await.unwrap();
        assert_eq!(late_kept.records[0].name(), "span-2");
        assert_eq!(late_kept.len(), 1);
        assert_eq!(sampler.stats().late_spans, 2);
        assert!(sampler.buffer.is_empty());
        assert_eq!(ctx.metrics.dropped(), 2);
    }

    #[tokio::test]
    async fn test_non_span_input_is_rejected() {
        let mut sampler = TailSamplingProcessor::new(settings(ERRORS_ONLY), context("tail_sampling"));
        let (tx, _rx) = mpsc::channel(1);
        let mut out = Emitter::new(tx);
        let result = sampler.process(Batch::new(vec![log("x")]), &mut out).await;
        assert!(matches!(result, Err(ProcessorError::UnsupportedSignal { .. })));
    }

    #[test]
    fn test_settings_validation() {
        for yaml in [
            "{decision_wait: 1s, max_trace_age: 5s, policies: []}",
            "{decision_wait: 1s, max_trace_age: 500ms, policies: [{type: always_sample}]}",
            "{decision_wait: 1s, max_trace_age: 5s, policies: [{type: probabilistic, probability: 2.0}]}",
        ] {
            let s: TailSamplingSettings = serde_yaml::from_str(yaml).unwrap();
            assert!(s.validate().is_err(), "{yaml}");
        }
        let missing: Result<TailSamplingSettings, _> =
            serde_yaml::from_str("{decision_wait: 1s, policies: [{type: always_sample}]}");
        assert!(missing.is_err());
    }
}
