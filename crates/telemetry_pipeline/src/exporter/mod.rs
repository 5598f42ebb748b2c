//! Exporters.
//!
//! Every exporter instance owns one bounded queue, fed by the fan-out of
//! each pipeline that references it, and one worker that runs up to
//! `max_concurrent_exports` exports at a time. Batches arrive behind an
//! `Arc` and are never modified here.
//!
//! # Rust 2024 Edition Features
//!
//! - Native async traits (no `#[async_trait]` macro)
//! - [`ExporterBoxed`] is the object-safe twin used for dynamic dispatch

pub mod debug;
pub mod file;
pub mod http;
pub mod retry;
pub mod stream;

use crate::batch::Batch;
use crate::config::{parse_options, Options};
use crate::error::ExportError;
use crate::metrics::{ComponentHealth, PipelineMetrics};
use crate::registry::SettingsError;
use serde::Deserialize;
use serde_yaml::Mapping;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub use debug::{DebugExporter, DebugSettings, Verbosity};
pub use file::{FileExporter, FileSettings};
pub use http::{HttpExporter, HttpSettings};
pub use retry::{RetrySettings, RetryingExporter};
pub use stream::{StreamExporter, StreamExporterSettings};

/// Sends batches to one destination.
pub trait Exporter: Send + Sync {
    fn export(&self, batch: Arc<Batch>) -> impl Future<Output = Result<(), ExportError>> + Send;

    /// Releases connections or file handles. Called once, after the last export.
    fn shutdown(&self) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;
}

type ExportFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + 'a>>;

/// Object-safe version of [`Exporter`].
pub trait ExporterBoxed: Send + Sync {
    fn export_boxed(&self, batch: Arc<Batch>) -> ExportFuture<'_>;

    fn shutdown_boxed(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    fn name(&self) -> &str;
}

/// Blanket implementation: any Exporter can be used as ExporterBoxed
impl<T: Exporter> ExporterBoxed for T {
    fn export_boxed(&self, batch: Arc<Batch>) -> ExportFuture<'_> {
        Box::pin(self.export(batch))
    }

    fn shutdown_boxed(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.shutdown())
    }

    fn name(&self) -> &str {
        Exporter::name(self)
    }
}

/// Lets wrappers such as [`RetryingExporter`] decorate a boxed exporter.
impl Exporter for Box<dyn ExporterBoxed> {
    fn export(&self, batch: Arc<Batch>) -> impl Future<Output = Result<(), ExportError>> + Send {
        self.as_ref().export_boxed(batch)
    }

    fn shutdown(&self) -> impl Future<Output = ()> + Send {
        self.as_ref().shutdown_boxed()
    }

    fn name(&self) -> &str {
        self.as_ref().name()
    }
}

/// Exporter that discards all batches
#[derive(Debug, Default)]
pub struct NullExporter;

impl Exporter for NullExporter {
    async fn export(&self, _batch: Arc<Batch>) -> Result<(), ExportError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

fn default_queue_size() -> usize {
    256
}

fn default_max_concurrent_exports() -> usize {
    1
}

/// Options shared by every exporter type.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommonSettings {
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_max_concurrent_exports")]
    pub max_concurrent_exports: usize,
    /// No section means a single attempt per batch.
    #[serde(default)]
    pub retry_on_failure: Option<RetrySettings>,
}

const COMMON_KEYS: [&str; 3] = ["queue_size", "max_concurrent_exports", "retry_on_failure"];

#[derive(Debug, Clone)]
pub enum ExporterKind {
    Debug(DebugSettings),
    File(FileSettings),
    Http(HttpSettings),
    Stream(StreamExporterSettings),
    Null,
}

#[derive(Debug, Clone)]
pub struct ExporterSettings {
    pub common: CommonSettings,
    pub kind: ExporterKind,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoOptions {}

impl ExporterSettings {
    pub fn parse(kind: &str, options: &Options) -> Result<Self, SettingsError> {
        let mut specific = options.clone();
        let mut common = Mapping::new();
        for key in COMMON_KEYS {
            if let Some(value) = specific.take(key) {
                common.insert(key.into(), value);
            }
        }
        let kind = match kind {
            "debug" => ExporterKind::Debug(parse_options(&specific)?),
            "file" => ExporterKind::File(parse_options(&specific)?),
            "http" => ExporterKind::Http(parse_options(&specific)?),
            "stream" => ExporterKind::Stream(parse_options(&specific)?),
            "null" => {
                parse_options::<NoOptions>(&specific)?;
                ExporterKind::Null
            }
            _ => return Err(SettingsError::UnknownType),
        };
        let common: CommonSettings = parse_options(&Options(common))?;

        if common.queue_size == 0 {
            return Err(SettingsError::Invalid("queue_size must be at least 1".into()));
        }
        if common.max_concurrent_exports == 0 {
            return Err(SettingsError::Invalid("max_concurrent_exports must be at least 1".into()));
        }
        if let Some(retry) = &common.retry_on_failure {
            retry.validate().map_err(SettingsError::Invalid)?;
        }
        match &kind {
            ExporterKind::Http(http) => http.validate().map_err(SettingsError::Invalid)?,
            ExporterKind::Stream(stream) => stream.validate().map_err(SettingsError::Invalid)?,
            _ => {}
        }
        Ok(Self { common, kind })
    }

    /// Builds the exporter, wrapped for retries when configured.
    pub fn build(&self, cancel: CancellationToken) -> Result<Arc<dyn ExporterBoxed>, String> {
        let base: Box<dyn ExporterBoxed> = match &self.kind {
            ExporterKind::Debug(s) => Box::new(DebugExporter::new(s.verbosity)),
            ExporterKind::File(s) => Box::new(FileExporter::new(&s.path)),
            ExporterKind::Http(s) => Box::new(HttpExporter::new(s)?),
            ExporterKind::Stream(s) => Box::new(StreamExporter::new(s)),
            ExporterKind::Null => Box::new(NullExporter),
        };
        Ok(match &self.common.retry_on_failure {
            Some(retry) => Arc::new(RetryingExporter::new(base, retry.clone(), cancel)),
            None => Arc::from(base),
        })
    }
}

/// One fan-out copy of a batch, with the pipeline it came from.
pub struct ExportRequest {
    pub batch: Arc<Batch>,
    pub origin: Arc<PipelineMetrics>,
}

/// Helper function to export a batch and record metrics (for concurrent tasks)
async fn export_batch(
    exporter: Arc<dyn ExporterBoxed>,
    request: ExportRequest,
    health: Arc<ComponentHealth>,
) {
    let records = request.batch.len() as u64;
    let pipeline = Arc::clone(&request.batch.pipeline);
    let sequence = request.batch.sequence;
    match exporter.export_boxed(request.batch).await {
        Ok(()) => request.origin.record_exported(records),
        Err(ExportError::Cancelled) => {}
        Err(e) => {
            request.origin.record_lost(records);
            tracing::warn!(
                component = %health.id(),
                pipeline = %pipeline,
                sequence,
                records,
                error = %e,
                "export failed; batch dropped"
            );
            health.record_error(&e);
        }
    }
}

/// Drains one exporter queue until every feeding pipeline has finished, or
/// until forced stop aborts in-flight exports.
pub(crate) async fn run_exporter(
    exporter: Arc<dyn ExporterBoxed>,
    mut queue: mpsc::Receiver<ExportRequest>,
    max_concurrent: usize,
    health: Arc<ComponentHealth>,
    cancel: CancellationToken,
) {
    // Semaphore to limit concurrent exports
    let semaphore = Arc::new(Semaphore::new(max_concurrent));
    // JoinSet to track in-flight export tasks
    let mut tasks: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tasks.shutdown().await;
                return;
            }
            // Reap completed export tasks (non-blocking)
            Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = result {
                    tracing::error!(component = %health.id(), error = %e, "export task panicked");
                    health.record_error(e);
                }
            }
            next = queue.recv() => {
                let Some(request) = next else { break };
                let permit = tokio::select! {
                    permit = Arc::clone(&semaphore).acquire_owned() => permit,
                    _ = cancel.cancelled() => {
                        tasks.shutdown().await;
                        return;
                    }
                };
                let Ok(permit) = permit else { break };
                let exporter = Arc::clone(&exporter);
                let health = Arc::clone(&health);
                tasks.spawn(async move {
                    export_batch(exporter, request, health).await;
                    drop(permit);
                });
            }
        }
    }

    // Wait for all in-flight exports to complete
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tasks.shutdown().await;
                return;
            }
            next = tasks.join_next() => match next {
                Some(Err(e)) => health.record_error(e),
                Some(Ok(())) => {}
                None => break,
            },
        }
    }
    exporter.shutdown_boxed().await;
    tracing::debug!(component = %health.id(), "exporter drained");
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Test exporter that records all exported batches for verification
    #[derive(Default)]
    pub struct RecordingExporter {
        pub batches: Mutex<Vec<Arc<Batch>>>,
        pub delay: Option<Duration>,
    }

    impl RecordingExporter {
        pub fn exported_records(&self) -> usize {
            self.batches.lock().unwrap().iter().map(|b| b.len()).sum()
        }
    }

    impl Exporter for RecordingExporter {
        async fn export(&self, batch: Arc<Batch>) -> Result<(), ExportError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    /// Fails a fixed number of times, then succeeds.
    pub struct FlakyExporter {
        pub failures: Mutex<u32>,
        pub error: ExportError,
    }

    impl Exporter for FlakyExporter {
        async fn export(&self, _batch: Arc<Batch>) -> Result<(), ExportError> {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(self.error.clone());
            }
            Ok(())
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use crate::component::Section;
    use crate::processor::test_util::log;
    use std::sync::Mutex;
    use std::time::Duration;

    fn request(records: usize, origin: &Arc<PipelineMetrics>) -> ExportRequest {
        ExportRequest {
            batch: Arc::new(Batch::new((0..records).map(|i| log(&i.to_string())).collect())),
            origin: Arc::clone(origin),
        }
    }

    #[test]
    fn test_parse_splits_common_options() {
        let options: Options = serde_yaml::from_str(
            "{path: /tmp/x.jsonl, queue_size: 4, retry_on_failure: {initial_interval: 10ms, max_interval: 1s, multiplier: 2.0, max_elapsed_time: 5s}}",
        )
        .unwrap();
        let settings = ExporterSettings::parse("file", &options).unwrap();
        assert_eq!(settings.common.queue_size, 4);
        assert_eq!(settings.common.max_concurrent_exports, 1);
        assert!(settings.common.retry_on_failure.is_some());
        assert!(matches!(settings.kind, ExporterKind::File(_)));

        let unknown: Options = serde_yaml::from_str("{path: /tmp/x, colour: red}").unwrap();
        assert!(matches!(
            ExporterSettings::parse("file", &unknown),
            Err(SettingsError::Invalid(_))
        ));
        assert!(matches!(
            ExporterSettings::parse("kafka", &Options::default()),
            Err(SettingsError::UnknownType)
        ));
    }

    #[tokio::test]
    async fn test_worker_counts_exported_and_lost() {
        let origin = PipelineMetrics::new(Arc::from("logs"));
        let health = ComponentHealth::new(Section::Exporter, "flaky");
        let exporter: Arc<dyn ExporterBoxed> = Arc::new(FlakyExporter {
            failures: Mutex::new(1),
            error: ExportError::Permanent("rejected".into()),
        });
        let (tx, rx) = mpsc::channel(4);
        let worker = tokio::spawn(run_exporter(exporter, rx, 1, Arc::clone(&health), CancellationToken::new()));

        tx.send(request(3, &origin)).await.unwrap();
        tx.send(request(2, &origin)).await.unwrap();
        drop(tx);
        worker.await.unwrap();

        assert_eq!(origin.lost(), 3);
        assert_eq!(origin.exported(), 2);
        assert_eq!(health.error_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_exports_are_bounded() {
        let origin = PipelineMetrics::new(Arc::from("logs"));
        let recording = Arc::new(RecordingExporter {
            delay: Some(Duration::from_millis(100)),
            ..Default::default()
        });
        let exporter: Arc<dyn ExporterBoxed> = recording.clone();
        let (tx, rx) = mpsc::channel(8);
        let health = ComponentHealth::new(Section::Exporter, "recording");
        let worker = tokio::spawn(run_exporter(exporter, rx, 2, health, CancellationToken::new()));

        let start = tokio::time::Instant::now();
        for _ in 0..4 {
            tx.send(request(1, &origin)).await.unwrap();
        }
        drop(tx);
        worker.await.unwrap();

        // Two waves of two concurrent exports.
        assert_eq!(start.elapsed(), Duration::from_millis(200));
        assert_eq!(recording.exported_records(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_stop_aborts_in_flight_exports() {
        let origin = PipelineMetrics::new(Arc::from("logs"));
        let exporter: Arc<dyn ExporterBoxed> = Arc::new(RecordingExporter {
            delay: Some(Duration::from_secs(3600)),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(8);
        let health = ComponentHealth::new(Section::Exporter, "recording");
        let worker = tokio::spawn(run_exporter(exporter, rx, 1, health, cancel.clone()));

        tx.send(request(5, &origin)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        worker.await.unwrap();
        assert_eq!(origin.exported(), 0);
        assert_eq!(origin.lost(), 0);
    }
}
