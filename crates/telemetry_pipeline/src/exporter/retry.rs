//! Retry with exponential backoff.
//!
//! Only [`ExportError::Retryable`] failures are retried. The next wait is
//! `min(previous * multiplier, max_interval)`, optionally jittered, and no
//! retry starts if its wait would end past `max_elapsed_time` measured from
//! the first attempt.

use super::Exporter;
use crate::batch::Batch;
use crate::error::ExportError;
use rand::Rng;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// Configuration for retry behavior. Every field except `jitter` is
/// required.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    /// Delay before the first retry.
    #[serde(with = "crate::config::duration")]
    pub initial_interval: Duration,
    /// Maximum delay between retries (caps exponential growth).
    #[serde(with = "crate::config::duration")]
    pub max_interval: Duration,
    pub multiplier: f64,
    #[serde(with = "crate::config::duration")]
    pub max_elapsed_time: Duration,
    /// Randomization factor in `[0, 1]`: each wait is scaled by a random
    /// factor in `[1 - jitter, 1 + jitter]`.
    #[serde(default)]
    pub jitter: f64,
}

impl RetrySettings {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.initial_interval.is_zero() {
            return Err("retry_on_failure.initial_interval must be positive".into());
        }
        if self.max_interval < self.initial_interval {
            return Err("retry_on_failure.max_interval must not be below initial_interval".into());
        }
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err("retry_on_failure.multiplier must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("retry_on_failure.jitter must be within [0, 1]".into());
        }
        Ok(())
    }

    fn next_interval(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier).min(self.max_interval)
    }

    fn jittered(&self, interval: Duration) -> Duration {
        if self.jitter == 0.0 {
            return interval;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        interval.mul_f64(factor)
    }
}

/// An exporter wrapper that retries transient failures with exponential
/// backoff.
pub struct RetryingExporter<E: Exporter> {
    inner: E,
    settings: RetrySettings,
    cancel: CancellationToken,
    /// Metrics: total retry attempts made
    total_retries: AtomicU64,
    /// Metrics: successful exports after retry (not first attempt)
    recovered_exports: AtomicU64,
}

impl<E: Exporter> RetryingExporter<E> {
    /// `cancel` interrupts a pending backoff wait on forced stop.
    pub fn new(inner: E, settings: RetrySettings, cancel: CancellationToken) -> Self {
        Self {
            inner,
            settings,
            cancel,
            total_retries: AtomicU64::new(0),
            recovered_exports: AtomicU64::new(0),
        }
    }

    /// Returns the total number of retry attempts made.
    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Returns exports that succeeded after at least one retry.
    pub fn recovered_exports(&self) -> u64 {
        self.recovered_exports.load(Ordering::Relaxed)
    }
}

impl<E: Exporter> Exporter for RetryingExporter<E> {
    async fn export(&self, batch: Arc<Batch>) -> Result<(), ExportError> {
        let started = Instant::now();
        let mut interval = self.settings.initial_interval;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let last = match self.inner.export(Arc::clone(&batch)).await {
                Ok(()) => {
                    if attempts > 1 {
                        self.recovered_exports.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e.to_string(),
            };

            let wait = self.settings.jittered(interval);
            if started.elapsed() + wait > self.settings.max_elapsed_time {
                return Err(ExportError::RetriesExhausted { attempts, last });
            }
            self.total_retries.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                exporter = self.inner.name(),
                attempts,
                wait = ?wait,
                error = %last,
                "export failed; retrying"
            );
            tokio::select! {
                _ = sleep(wait) => {}
                _ = self.cancel.cancelled() => return Err(ExportError::Cancelled),
            }
            interval = self.settings.next_interval(interval);
        }
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await;
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::test_util::FlakyExporter;
    use crate::processor::test_util::log;
    use std::sync::Mutex;

    fn settings(max_elapsed_ms: u64) -> RetrySettings {
        RetrySettings {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(400),
            multiplier: 2.0,
            max_elapsed_time: Duration::from_millis(max_elapsed_ms),
            jitter: 0.0,
        }
    }

    fn batch() -> Arc<Batch> {
        Arc::new(Batch::new(vec![log("x")]))
    }

    fn flaky(failures: u32, error: ExportError) -> FlakyExporter {
        FlakyExporter {
            failures: Mutex::new(failures),
            error,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let s = settings(1000);
        let mut interval = s.initial_interval;
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(interval.as_millis());
            interval = s.next_interval(interval);
        }
        assert_eq!(seen, [100, 200, 400, 400]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let exporter = RetryingExporter::new(
            flaky(2, ExportError::Retryable("503".into())),
            settings(10_000),
            CancellationToken::new(),
        );
        let start = Instant::now();
        exporter.export(batch()).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(300));
        assert_eq!(exporter.total_retries(), 2);
        assert_eq!(exporter.recovered_exports(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_at_max_elapsed_time() {
        let exporter = RetryingExporter::new(
            flaky(100, ExportError::Retryable("timeout".into())),
            settings(1_000),
            CancellationToken::new(),
        );
        let start = Instant::now();
        let err = exporter.export(batch()).await.unwrap_err();
        // Waits 100 + 200 + 400 = 700ms; the next 400ms wait would overrun.
        assert_eq!(start.elapsed(), Duration::from_millis(700));
        assert!(matches!(err, ExportError::RetriesExhausted { attempts: 4, .. }));
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let exporter = RetryingExporter::new(
            flaky(1, ExportError::Permanent("400 Bad Request".into())),
            settings(10_000),
            CancellationToken::new(),
        );
        assert!(matches!(exporter.export(batch()).await, Err(ExportError::Permanent(_))));
        assert_eq!(exporter.total_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let exporter = Arc::new(RetryingExporter::new(
            flaky(100, ExportError::Retryable("down".into())),
            settings(3_600_000),
            cancel.clone(),
        ));
        let task = {
            let exporter = Arc::clone(&exporter);
            tokio::spawn(async move { exporter.export(batch()).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        assert!(matches!(task.await.unwrap(), Err(ExportError::Cancelled)));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let s = RetrySettings { jitter: 0.5, ..settings(1000) };
        for _ in 0..100 {
            let wait = s.jittered(Duration::from_millis(100));
            assert!(wait >= Duration::from_millis(50) && wait <= Duration::from_millis(150));
        }
    }
}
