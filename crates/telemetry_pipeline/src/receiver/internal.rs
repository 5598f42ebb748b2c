//! Scheduled-callback receiver exposing the service's own counters.
//!
//! Every `interval` the receiver calls a synchronous [`ScheduledCallback`]
//! and turns its observations into metric points. The callback must not
//! block; it runs on the receiver's task.

use super::delivery::{self, LANE_CAPACITY};
use super::{join_within, Receiver, Replica};
use crate::error::ReceiverError;
use crate::metrics::Telemetry;
use crate::record::{
    now_unix_nanos, AggregationKind, AttributeValue, InstrumentationScope, MetricPoint, Record,
    RecordBody, Resource,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// One value produced by a scheduled callback.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub name: String,
    pub value: f64,
    pub aggregation: AggregationKind,
    pub unit: Option<String>,
    pub attributes: Vec<(String, AttributeValue)>,
}

impl Observation {
    pub fn counter(name: &str, value: u64) -> Self {
        Self {
            name: name.to_string(),
            value: value as f64,
            aggregation: AggregationKind::MonotonicSum,
            unit: Some("{record}".into()),
            attributes: Vec::new(),
        }
    }

    pub fn gauge(name: &str, value: u64) -> Self {
        Self {
            aggregation: AggregationKind::Gauge,
            ..Self::counter(name, value)
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<AttributeValue>) -> Self {
        self.attributes.push((key.to_string(), value.into()));
        self
    }
}

/// Synchronous source of observations invoked on a timer.
pub trait ScheduledCallback: Send + Sync {
    fn collect(&self) -> Vec<Observation>;
}

impl ScheduledCallback for Telemetry {
    fn collect(&self) -> Vec<Observation> {
        let mut observations = Vec::with_capacity(self.pipelines().len() * 7);
        for p in self.pipelines() {
            let name = p.name().to_string();
            let counters = [
                ("tpipe.pipeline.received", p.received()),
                ("tpipe.pipeline.refused", p.refused()),
                ("tpipe.pipeline.processed", p.processed()),
                ("tpipe.pipeline.dropped", p.dropped()),
                ("tpipe.pipeline.exported", p.exported()),
                ("tpipe.pipeline.lost", p.lost()),
            ];
            for (metric, value) in counters {
                observations.push(Observation::counter(metric, value).with_attribute("pipeline", name.as_str()));
            }
            observations.push(
                Observation::gauge("tpipe.pipeline.in_flight", p.in_flight().usage())
                    .with_attribute("pipeline", name.as_str()),
            );
        }
        observations
    }
}

fn default_interval() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InternalMetricsSettings {
    #[serde(default = "default_interval", with = "crate::config::duration")]
    pub interval: Duration,
}

impl InternalMetricsSettings {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.interval.is_zero() {
            return Err("interval must be positive".into());
        }
        Ok(())
    }
}

pub struct InternalMetricsReceiver {
    interval: Duration,
    callback: Arc<dyn ScheduledCallback>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
    lanes: Vec<JoinHandle<()>>,
}

impl InternalMetricsReceiver {
    pub fn new(settings: InternalMetricsSettings, callback: Arc<dyn ScheduledCallback>) -> Self {
        Self {
            interval: settings.interval,
            callback,
            stop: CancellationToken::new(),
            task: None,
            lanes: Vec::new(),
        }
    }
}

fn to_records(observations: Vec<Observation>, resource: &Arc<Resource>, scope: &Arc<InstrumentationScope>) -> Vec<Record> {
    let now = now_unix_nanos();
    observations
        .into_iter()
        .map(|o| {
            let mut record = Record::new(
                Arc::clone(resource),
                Arc::clone(scope),
                now,
                RecordBody::Metric(MetricPoint {
                    name: o.name,
                    value: o.value,
                    aggregation: o.aggregation,
                    unit: o.unit,
                }),
            );
            record.attributes.extend(o.attributes);
            record
        })
        .collect()
}

impl Receiver for InternalMetricsReceiver {
    async fn start(&mut self, replicas: Vec<Arc<Replica>>) -> Result<(), ReceiverError> {
        let callback = Arc::clone(&self.callback);
        let period = self.interval;
        let stop = self.stop.clone();
        let resource = Arc::new(Resource::from_pairs([("service.name", "telemetry-pipeline")]));
        let scope = Arc::new(InstrumentationScope::new("telemetry_pipeline.internal_metrics", None));
        let (deliveries, lanes) = delivery::spawn(replicas, LANE_CAPACITY, None);
        self.lanes = lanes;

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; report after one period.
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                deliveries.offer_records(&to_records(callback.collect(), &resource, &scope));
            }
        }));
        Ok(())
    }

    async fn shutdown(&mut self, deadline: Duration) {
        let until = Instant::now() + deadline;
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            join_within(task, deadline, "internal_metrics").await;
        }
        delivery::join_lanes(std::mem::take(&mut self.lanes), until, "internal_metrics").await;
    }

    fn name(&self) -> &str {
        "internal_metrics"
    }
}
