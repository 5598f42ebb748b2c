//! Receivers.
//!
//! A receiver referenced by several pipelines runs once but hands its input
//! to one [`Replica`] per pipeline. Each replica decodes the raw payload on
//! its own and keeps only records of its pipeline's signal type. Replicas
//! are fed through independent lanes (see [`delivery`]).

pub(crate) mod delivery;
pub mod internal;
pub mod scrape;
pub mod sink;
pub mod stream;

use crate::batch::Batch;
use crate::config::{parse_options, Options};
use crate::error::{DecodeError, ReceiverError, ResourceExhaustion, SinkError};
use crate::metrics::{ComponentHealth, Telemetry};
use crate::record::{Record, SignalType};
use crate::registry::SettingsError;
use crate::wire;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use internal::{InternalMetricsReceiver, InternalMetricsSettings, Observation, ScheduledCallback};
pub use scrape::{ScrapeReceiver, ScrapeSettings};
pub use sink::{Admission, NullSink, PipelineSink, Producer, RecordSink, RecordSinkBoxed};
pub use stream::{StreamReceiver, StreamSettings};

/// Per-pipeline delivery target of a receiver.
pub struct Replica {
    pipeline: Arc<str>,
    signal: SignalType,
    producer: Producer,
    health: Arc<ComponentHealth>,
    /// Metrics: payloads that failed to decode
    decode_errors: AtomicU64,
    /// Metrics: payloads refused because the delivery lane was full
    overflows: AtomicU64,
}

impl Replica {
    pub fn new(
        pipeline: Arc<str>,
        signal: SignalType,
        producer: Producer,
        health: Arc<ComponentHealth>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            signal,
            producer,
            health,
            decode_errors: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
        })
    }

    pub fn pipeline(&self) -> &Arc<str> {
        &self.pipeline
    }

    pub fn signal(&self) -> SignalType {
        self.signal
    }

    pub fn health(&self) -> &Arc<ComponentHealth> {
        &self.health
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Decodes `payload`. Failures are counted and yield `None`.
    pub fn decode(&self, payload: &[u8]) -> Option<Vec<Record>> {
        match wire::decode(payload) {
            Ok(records) => Some(records),
            Err(e) => {
                self.record_decode_error(&e);
                None
            }
        }
    }

    /// Injects already decoded records, skipping other signal types.
    pub async fn inject(&self, records: Vec<Record>) {
        let records: Vec<Record> = records
            .into_iter()
            .filter(|r| r.signal() == self.signal)
            .collect();
        if records.is_empty() {
            return;
        }
        let count = records.len();
        if let Err(e) = self.producer.send(Batch::new(records)).await {
            tracing::debug!(
                pipeline = %self.pipeline,
                component = %self.health.id(),
                records = count,
                error = %e,
                "pipeline refused records"
            );
            self.health.record_error(&e);
        }
    }

    pub fn record_decode_error(&self, error: &DecodeError) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            pipeline = %self.pipeline,
            component = %self.health.id(),
            error = %error,
            "dropping undecodable payload"
        );
        self.health.record_error(error);
    }

    pub fn record_overflow(&self) {
        self.overflows.fetch_add(1, Ordering::Relaxed);
        let error = SinkError::from(ResourceExhaustion::DeliveryBacklog {
            pipeline: self.pipeline.to_string(),
        });
        tracing::debug!(
            pipeline = %self.pipeline,
            component = %self.health.id(),
            error = %error,
            "dropping payload for a backed up pipeline"
        );
        self.health.record_error(error);
    }
}

/// A protocol adapter feeding one or more pipelines.
pub trait Receiver: Send {
    /// Begins listening or scraping. Fails only when the receiver cannot
    /// acquire its endpoint.
    fn start(&mut self, replicas: Vec<Arc<Replica>>) -> impl Future<Output = Result<(), ReceiverError>> + Send;

    /// Stops accepting input, waits up to `deadline` for in-flight
    /// deliveries, then aborts what remains.
    fn shutdown(&mut self, deadline: Duration) -> impl Future<Output = ()> + Send;

    /// Bound address, for listening receivers.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn name(&self) -> &str;
}

type StartFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ReceiverError>> + Send + 'a>>;

/// Object-safe version of [`Receiver`].
pub trait ReceiverBoxed: Send {
    fn start_boxed(&mut self, replicas: Vec<Arc<Replica>>) -> StartFuture<'_>;

    fn shutdown_boxed(&mut self, deadline: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn name(&self) -> &str;
}

impl<T: Receiver> ReceiverBoxed for T {
    fn start_boxed(&mut self, replicas: Vec<Arc<Replica>>) -> StartFuture<'_> {
        Box::pin(self.start(replicas))
    }

    fn shutdown_boxed(&mut self, deadline: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.shutdown(deadline))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Receiver::local_addr(self)
    }

    fn name(&self) -> &str {
        Receiver::name(self)
    }
}

/// Typed options of every built-in receiver.
#[derive(Debug, Clone)]
pub enum ReceiverSettings {
    Stream(StreamSettings),
    HttpScrape(ScrapeSettings),
    InternalMetrics(InternalMetricsSettings),
}

impl ReceiverSettings {
    pub fn parse(kind: &str, options: &Options) -> Result<Self, SettingsError> {
        let settings = match kind {
            "stream" => Self::Stream(parse_options(options)?),
            "http_scrape" => Self::HttpScrape(parse_options(options)?),
            "internal_metrics" => Self::InternalMetrics(parse_options(options)?),
            _ => return Err(SettingsError::UnknownType),
        };
        let checked = match &settings {
            Self::Stream(s) => s.validate(),
            Self::HttpScrape(s) => s.validate(),
            Self::InternalMetrics(s) => s.validate(),
        };
        checked.map_err(SettingsError::Invalid)?;
        Ok(settings)
    }

    /// Builds the receiver. `internal_metrics` reads from `telemetry`.
    pub fn build(&self, telemetry: &Arc<Telemetry>) -> Result<Box<dyn ReceiverBoxed>, String> {
        Ok(match self {
            Self::Stream(s) => Box::new(StreamReceiver::new(s.clone())),
            Self::HttpScrape(s) => Box::new(ScrapeReceiver::new(s.clone())?),
            Self::InternalMetrics(s) => Box::new(InternalMetricsReceiver::new(
                s.clone(),
                Arc::clone(telemetry) as Arc<dyn ScheduledCallback>,
            )),
        })
    }
}

/// Waits for `task` up to `deadline`, aborting it on overrun.
pub(crate) async fn join_within(task: tokio::task::JoinHandle<()>, deadline: Duration, component: &str) {
    let abort = task.abort_handle();
    match tokio::time::timeout(deadline, task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_cancelled() => {}
        Ok(Err(e)) => tracing::error!(component, error = %e, "receiver task panicked"),
        Err(_) => {
            tracing::warn!(component, deadline = ?deadline, "receiver did not stop in time; aborting");
            abort.abort();
        }
    }
}
