//! Service runtime.
//!
//! Owns every task of a configured graph and drives its lifecycle:
//!
//! - **start**: exporters, then pipelines, then receivers, then the health
//!   reporter.
//! - **shutdown(deadline)**: stop receivers, close every intake, let each
//!   stage flush and each exporter finish its queue. Whatever is still
//!   running at the deadline is force-stopped and the records it held are
//!   reported as abandoned.

use crate::component::{ComponentId, ComponentState, Lifecycle, Section};
use crate::config::Config;
use crate::error::{ReceiverError, ServiceError};
use crate::exporter::run_exporter;
use crate::metrics::{ComponentHealth, HealthSummary, PipelineMetrics, Telemetry};
use crate::pipeline::{self, ExportTarget};
use crate::receiver::{Producer, ReceiverBoxed, Replica};
use crate::registry::Registry;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Outcome of [`Service::shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// Records still held by the pipelines when the deadline forced a stop.
    pub abandoned_records: u64,
    pub timed_out: bool,
    pub summary: HealthSummary,
}

struct RunningReceiver {
    id: ComponentId,
    receiver: Box<dyn ReceiverBoxed>,
    health: Vec<Arc<ComponentHealth>>,
}

pub struct Service {
    registry: Registry,
    telemetry: Arc<Telemetry>,
    metrics: Vec<Arc<PipelineMetrics>>,
    lifecycle: Lifecycle,
    /// Closes every pipeline intake.
    close: CancellationToken,
    /// Aborts every stage and exporter.
    force: CancellationToken,
    receivers: Vec<RunningReceiver>,
    producers: Vec<Producer>,
    pipeline_tasks: JoinSet<()>,
    exporter_tasks: JoinSet<()>,
    health: Vec<Arc<ComponentHealth>>,
    reporter: Option<JoinHandle<()>>,
    reporter_stop: CancellationToken,
}

impl Service {
    /// Validates `config` and prepares, but does not start, the graph.
    pub fn new(config: &Config) -> Result<Self, ServiceError> {
        Ok(Self::from_registry(Registry::build(config)?))
    }

    pub fn from_registry(registry: Registry) -> Self {
        let metrics: Vec<Arc<PipelineMetrics>> = registry
            .pipelines
            .iter()
            .map(|p| PipelineMetrics::new(Arc::clone(&p.name)))
            .collect();
        Self {
            telemetry: Telemetry::new(metrics.clone()),
            metrics,
            registry,
            lifecycle: Lifecycle::default(),
            close: CancellationToken::new(),
            force: CancellationToken::new(),
            receivers: Vec::new(),
            producers: Vec::new(),
            pipeline_tasks: JoinSet::new(),
            exporter_tasks: JoinSet::new(),
            health: Vec::new(),
            reporter: None,
            reporter_stop: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn state(&self) -> ComponentState {
        self.lifecycle.state()
    }

    /// Bound address of a listening receiver, by configured id.
    pub fn receiver_addr(&self, id: &str) -> Option<SocketAddr> {
        self.receivers
            .iter()
            .find(|r| r.id.to_string() == id)
            .and_then(|r| r.receiver.local_addr())
    }

    /// In-process producer for a pipeline's intake queue.
    pub fn pipeline_sink(&self, pipeline: &str) -> Option<Producer> {
        self.registry
            .pipelines
            .iter()
            .position(|p| &*p.name == pipeline)
            .and_then(|i| self.producers.get(i).cloned())
    }

    pub async fn start(&mut self) -> Result<(), ServiceError> {
        self.lifecycle.transition(ComponentState::Started)?;
        if let Err(e) = self.start_components().await {
            tracing::error!(error = %e, "service failed to start");
            self.abort().await;
            return Err(e);
        }
        self.spawn_reporter();
        tracing::info!(
            pipelines = self.registry.pipelines.len(),
            receivers = self.receivers.len(),
            "service started"
        );
        Ok(())
    }

    async fn start_components(&mut self) -> Result<(), ServiceError> {
        // Exporters first, so no pipeline ever sends into a missing queue.
        let mut queues = Vec::with_capacity(self.registry.exporters.len());
        for node in &self.registry.exporters {
            if node.pipelines.is_empty() {
                queues.push(None);
                continue;
            }
            let exporter = node
                .settings
                .build(self.force.clone())
                .map_err(|reason| ServiceError::Exporter {
                    id: node.id.to_string(),
                    reason,
                })?;
            let (tx, rx) = mpsc::channel(node.settings.common.queue_size);
            let health = ComponentHealth::for_component(Section::Exporter, &node.id, None);
            health.advance(ComponentState::Started);
            self.telemetry.register(&health);
            self.health.push(Arc::clone(&health));
            self.exporter_tasks.spawn(run_exporter(
                exporter,
                rx,
                node.settings.common.max_concurrent_exports,
                health,
                self.force.clone(),
            ));
            tracing::info!(component = %node.id, "exporter started");
            queues.push(Some(tx));
        }

        for (spec, metrics) in self.registry.pipelines.iter().zip(&self.metrics) {
            let targets = spec
                .exporters
                .iter()
                .filter_map(|&e| {
                    queues[e.0].as_ref().map(|queue| ExportTarget {
                        id: self.registry.exporter(e).id.clone(),
                        queue: queue.clone(),
                    })
                })
                .collect();
            let running = pipeline::spawn(
                &self.registry,
                spec,
                metrics,
                targets,
                &self.close,
                &self.force,
                &mut self.pipeline_tasks,
            )
            .map_err(|(id, reason)| ServiceError::Processor {
                id: id.to_string(),
                reason,
            })?;
            for health in &running.health {
                self.telemetry.register(health);
                self.health.push(Arc::clone(health));
            }
            self.producers.push(running.producer);
        }
        // Fan-outs now hold the only senders; each exporter queue closes once
        // every pipeline feeding it has finished.
        drop(queues);

        for node in &self.registry.receivers {
            if node.pipelines.is_empty() {
                continue;
            }
            let mut receiver = node
                .settings
                .build(&self.telemetry)
                .map_err(|reason| ServiceError::Receiver {
                    id: node.id.to_string(),
                    source: ReceiverError::Setup(reason),
                })?;
            let mut health = Vec::with_capacity(node.pipelines.len());
            let mut replicas = Vec::with_capacity(node.pipelines.len());
            for &p in &node.pipelines {
                let spec = self.registry.pipeline(p);
                let replica_health = ComponentHealth::for_component(Section::Receiver, &node.id, Some(&spec.name));
                replica_health.advance(ComponentState::Started);
                self.telemetry.register(&replica_health);
                replicas.push(Replica::new(
                    Arc::clone(&spec.name),
                    spec.signal,
                    self.producers[p.0].clone(),
                    Arc::clone(&replica_health),
                ));
                health.push(replica_health);
            }
            receiver
                .start_boxed(replicas)
                .await
                .map_err(|source| ServiceError::Receiver {
                    id: node.id.to_string(),
                    source,
                })?;
            tracing::info!(component = %node.id, pipelines = node.pipelines.len(), "receiver started");
            self.receivers.push(RunningReceiver {
                id: node.id.clone(),
                receiver,
                health,
            });
        }
        Ok(())
    }

    fn spawn_reporter(&mut self) {
        let period = self.registry.service.health_interval;
        let telemetry = Arc::clone(&self.telemetry);
        let stop = self.reporter_stop.clone();
        self.reporter = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return,
                    _ = ticker.tick() => telemetry.log_summary(),
                }
            }
        }));
    }

    /// Tears down whatever started, without draining.
    async fn abort(&mut self) {
        self.force.cancel();
        self.close.cancel();
        self.reporter_stop.cancel();
        for running in &mut self.receivers {
            running.receiver.shutdown_boxed(Duration::ZERO).await;
        }
        self.pipeline_tasks.shutdown().await;
        self.exporter_tasks.shutdown().await;
        self.finish();
    }

    fn finish(&mut self) {
        for health in self.receivers.iter().flat_map(|r| &r.health).chain(&self.health) {
            health.advance(ComponentState::Stopped);
        }
        if self.lifecycle.state() == ComponentState::Started {
            let _ = self.lifecycle.transition(ComponentState::Draining);
        }
        let _ = self.lifecycle.transition(ComponentState::Stopped);
    }

    /// Drains the service within `deadline`.
    ///
    /// Calling it on a service that never started, or twice, returns an
    /// empty report.
    pub async fn shutdown(&mut self, deadline: Duration) -> ShutdownReport {
        if self.lifecycle.transition(ComponentState::Draining).is_err() {
            self.finish();
            return ShutdownReport {
                abandoned_records: 0,
                timed_out: false,
                summary: self.telemetry.summary(),
            };
        }
        let until = Instant::now() + deadline;
        tracing::info!(deadline = ?deadline, "service draining");
        for health in self.receivers.iter().flat_map(|r| &r.health).chain(&self.health) {
            health.advance(ComponentState::Draining);
        }

        for running in &mut self.receivers {
            let remaining = until.saturating_duration_since(Instant::now());
            running.receiver.shutdown_boxed(remaining).await;
            for health in &running.health {
                health.advance(ComponentState::Stopped);
            }
        }

        self.close.cancel();
        let drained = join_all_until(&mut self.pipeline_tasks, until).await
            && join_all_until(&mut self.exporter_tasks, until).await;

        let mut abandoned_records = 0;
        if !drained {
            abandoned_records = self.metrics.iter().map(|m| m.in_flight().usage()).sum();
            tracing::warn!(abandoned_records, "shutdown deadline reached; forcing stop");
            self.force.cancel();
            self.pipeline_tasks.shutdown().await;
            self.exporter_tasks.shutdown().await;
        }

        self.reporter_stop.cancel();
        if let Some(reporter) = self.reporter.take() {
            let _ = reporter.await;
        }
        self.finish();
        self.telemetry.log_summary();
        tracing::info!(abandoned_records, timed_out = !drained, "service stopped");

        ShutdownReport {
            abandoned_records,
            timed_out: !drained,
            summary: self.telemetry.summary(),
        }
    }

    /// Starts the service, waits for `signal`, then drains within the
    /// configured `shutdown_timeout`.
    pub async fn run_until(&mut self, signal: impl Future<Output = ()>) -> Result<ShutdownReport, ServiceError> {
        self.start().await?;
        signal.await;
        tracing::info!("shutdown requested");
        let deadline = self.registry.service.shutdown_timeout;
        Ok(self.shutdown(deadline).await)
    }
}

/// Joins every task in `tasks`, giving up at `until`. Returns whether the
/// set drained.
async fn join_all_until(tasks: &mut JoinSet<()>, until: Instant) -> bool {
    loop {
        match tokio::time::timeout_at(until, tasks.join_next()).await {
            Ok(None) => return true,
            Ok(Some(Ok(()))) => {}
            Ok(Some(Err(e))) if e.is_cancelled() => {}
            Ok(Some(Err(e))) => tracing::error!(error = %e, "service task panicked"),
            Err(_) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Batch;
    use crate::processor::test_util::log;

    const CONFIG: &str = r#"
receivers:
  stream:
    endpoint: 127.0.0.1:0
processors:
  batch:
    max_batch_size: 100
    flush_interval: 1h
exporters:
  "null":
pipelines:
  logs:
    signal_type: logs
    receivers: [stream]
    processors: [batch]
    exporters: ["null"]
"#;

    #[tokio::test]
    async fn test_drain_flushes_partial_batches() {
        let mut service = Service::new(&Config::from_yaml(CONFIG).unwrap()).unwrap();
        service.start().await.unwrap();
        assert_eq!(service.state(), ComponentState::Started);
        assert!(service.receiver_addr("stream").is_some());

        let sink = service.pipeline_sink("logs").unwrap();
        sink.send(Batch::new(vec![log("a"), log("b")])).await.unwrap();

        let report = service.shutdown(Duration::from_secs(5)).await;
        assert!(!report.timed_out);
        assert_eq!(report.abandoned_records, 0);
        let logs = report.summary.pipeline("logs").unwrap();
        assert_eq!(logs.received, 2);
        assert_eq!(logs.processed, 2);
        assert_eq!(logs.exported, 2);
        assert_eq!(logs.in_flight, 0);
        assert_eq!(service.state(), ComponentState::Stopped);
        assert!(report
            .summary
            .components
            .iter()
            .all(|c| c.state == ComponentState::Stopped));

        // The intake is closed for good.
        assert!(sink.send(Batch::new(vec![log("late")])).await.is_err());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let mut service = Service::new(&Config::from_yaml(CONFIG).unwrap()).unwrap();
        service.start().await.unwrap();
        assert!(matches!(service.start().await, Err(ServiceError::Lifecycle(_))));
        service.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_start() {
        let config = Config::from_yaml(
            "receivers: {}\nexporters: {}\npipelines: {logs: {signal_type: logs, receivers: [stream], exporters: [debug]}}\n",
        )
        .unwrap();
        match Service::new(&config) {
            Err(ServiceError::Validation(errors)) => assert_eq!(errors.0.len(), 2),
            _ => panic!("expected validation errors"),
        }
    }

    #[tokio::test]
    async fn test_bind_failure_stops_everything() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let yaml = CONFIG.replace("127.0.0.1:0", &taken.local_addr().unwrap().to_string());
        let mut service = Service::new(&Config::from_yaml(&yaml).unwrap()).unwrap();
        assert!(matches!(service.start().await, Err(ServiceError::Receiver { .. })));
        assert_eq!(service.state(), ComponentState::Stopped);
    }
}
