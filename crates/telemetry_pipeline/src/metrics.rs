//! Per-pipeline counters and per-component health.
//!
//! Counters are plain atomics bumped with `Relaxed` ordering; a snapshot is
//! only ever approximately consistent across fields.

use crate::component::{ComponentId, ComponentState, Lifecycle, Section};
use crate::usage::UsageGauge;
use serde::Serialize;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Record counts for one pipeline.
///
/// `received` counts records accepted into the intake queue, `refused`
/// those rejected at intake or by a memory limiter in drop mode, `dropped`
/// those removed by processors (filtering, sampling, stage failures),
/// `processed` those leaving the chain. `exported` and `lost` are counted
/// once per destination exporter.
#[derive(Debug)]
pub struct PipelineMetrics {
    name: Arc<str>,
    received: AtomicU64,
    refused: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    exported: AtomicU64,
    lost: AtomicU64,
    in_flight: Arc<UsageGauge>,
}

impl PipelineMetrics {
    pub fn new(name: Arc<str>) -> Arc<Self> {
        Arc::new(Self {
            name,
            received: AtomicU64::new(0),
            refused: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            exported: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            in_flight: UsageGauge::unbounded(),
        })
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Records of this pipeline still held anywhere, exporter queues included.
    pub fn in_flight(&self) -> &Arc<UsageGauge> {
        &self.in_flight
    }

    pub fn record_received(&self, n: u64) {
        self.received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_refused(&self, n: u64) {
        self.refused.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_processed(&self, n: u64) {
        self.processed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_exported(&self, n: u64) {
        self.exported.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_lost(&self, n: u64) {
        self.lost.fetch_add(n, Ordering::Relaxed);
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn refused(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn exported(&self) -> u64 {
        self.exported.load(Ordering::Relaxed)
    }

    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            pipeline: self.name.to_string(),
            received: self.received(),
            refused: self.refused(),
            processed: self.processed(),
            dropped: self.dropped(),
            exported: self.exported(),
            lost: self.lost(),
            in_flight: self.in_flight.usage(),
        }
    }
}

/// Lifecycle, error count and most recent error of one component instance.
#[derive(Debug)]
pub struct ComponentHealth {
    section: Section,
    id: String,
    lifecycle: Lifecycle,
    errors: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl ComponentHealth {
    pub fn new(section: Section, id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            section,
            id: id.into(),
            lifecycle: Lifecycle::default(),
            errors: AtomicU64::new(0),
            last_error: Mutex::new(None),
        })
    }

    pub fn for_component(section: Section, id: &ComponentId, pipeline: Option<&str>) -> Arc<Self> {
        match pipeline {
            Some(pipeline) => Self::new(section, format!("{id}@{pipeline}")),
            None => Self::new(section, id.to_string()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn section(&self) -> Section {
        self.section
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Moves the component forward through every intermediate state up to
    /// `to`. States already passed are ignored.
    pub fn advance(&self, to: ComponentState) {
        loop {
            let from = self.lifecycle.state();
            if from >= to {
                return;
            }
            let next = match from {
                ComponentState::Created if to == ComponentState::Stopped => ComponentState::Stopped,
                ComponentState::Created => ComponentState::Started,
                ComponentState::Started => ComponentState::Draining,
                ComponentState::Draining | ComponentState::Stopped => ComponentState::Stopped,
            };
            if let Err(e) = self.lifecycle.transition(next) {
                tracing::debug!(component = %self.id, error = %e, "lifecycle transition skipped");
                return;
            }
        }
    }

    pub fn record_error(&self, error: impl Display) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.to_string());
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn snapshot(&self) -> ComponentSnapshot {
        ComponentSnapshot {
            section: self.section,
            component: self.id.clone(),
            state: self.lifecycle.state(),
            errors: self.error_count(),
            last_error: self.last_error(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineSnapshot {
    pub pipeline: String,
    pub received: u64,
    pub refused: u64,
    pub processed: u64,
    pub dropped: u64,
    pub exported: u64,
    pub lost: u64,
    pub in_flight: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentSnapshot {
    pub section: Section,
    pub component: String,
    pub state: ComponentState,
    pub errors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub pipelines: Vec<PipelineSnapshot>,
    pub components: Vec<ComponentSnapshot>,
}

impl HealthSummary {
    pub fn pipeline(&self, name: &str) -> Option<&PipelineSnapshot> {
        self.pipelines.iter().find(|p| p.pipeline == name)
    }

    pub fn component(&self, id: &str) -> Option<&ComponentSnapshot> {
        self.components.iter().find(|c| c.component == id)
    }
}

/// Every counter and health record of a running service.
#[derive(Debug, Default)]
pub struct Telemetry {
    pipelines: Vec<Arc<PipelineMetrics>>,
    components: Mutex<Vec<Arc<ComponentHealth>>>,
}

impl Telemetry {
    pub fn new(pipelines: Vec<Arc<PipelineMetrics>>) -> Arc<Self> {
        Arc::new(Self {
            pipelines,
            components: Mutex::new(Vec::new()),
        })
    }

    pub fn register(&self, health: &Arc<ComponentHealth>) {
        self.components
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(health));
    }

    pub fn pipelines(&self) -> &[Arc<PipelineMetrics>] {
        &self.pipelines
    }

    pub fn pipeline(&self, name: &str) -> Option<&Arc<PipelineMetrics>> {
        self.pipelines.iter().find(|p| &*p.name == name)
    }

    pub fn summary(&self) -> HealthSummary {
        let components = self
            .components
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|c| c.snapshot())
            .collect();
        HealthSummary {
            pipelines: self.pipelines.iter().map(|p| p.snapshot()).collect(),
            components,
        }
    }

    pub fn log_summary(&self) {
        let summary = self.summary();
        for p in &summary.pipelines {
            tracing::info!(
                pipeline = %p.pipeline,
                received = p.received,
                refused = p.refused,
                processed = p.processed,
                dropped = p.dropped,
                exported = p.exported,
                lost = p.lost,
                in_flight = p.in_flight,
                "pipeline health"
            );
        }
        for c in summary.components.iter().filter(|c| c.errors > 0) {
            tracing::warn!(
                component = %c.component,
                section = %c.section,
                errors = c.errors,
                last_error = c.last_error.as_deref().unwrap_or(""),
                "component errors"
            );
        }
    }
}
