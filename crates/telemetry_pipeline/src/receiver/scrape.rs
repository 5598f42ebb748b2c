//! Pull receiver: periodic HTTP GET of a JSON envelope.

use super::delivery::{self, LANE_CAPACITY};
use super::{join_within, Receiver, Replica};
use crate::error::ReceiverError;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScrapeSettings {
    pub endpoint: String,
    #[serde(with = "crate::config::duration")]
    pub interval: Duration,
    #[serde(default = "default_timeout", with = "crate::config::duration")]
    pub timeout: Duration,
}

impl ScrapeSettings {
    pub(crate) fn validate(&self) -> Result<(), String> {
        let url = reqwest::Url::parse(&self.endpoint)
            .map_err(|e| format!("invalid endpoint {:?}: {e}", self.endpoint))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!("endpoint {:?} must use http or https", self.endpoint));
        }
        if self.interval.is_zero() {
            return Err("interval must be positive".into());
        }
        if self.timeout.is_zero() {
            return Err("timeout must be positive".into());
        }
        Ok(())
    }
}

pub struct ScrapeReceiver {
    settings: ScrapeSettings,
    client: reqwest::Client,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
    lanes: Vec<JoinHandle<()>>,
    /// Metrics: scrapes that failed before a body was read
    failures: Arc<AtomicU64>,
}

impl ScrapeReceiver {
    pub fn new(settings: ScrapeSettings) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| format!("failed to build http client: {e}"))?;
        Ok(Self {
            settings,
            client,
            stop: CancellationToken::new(),
            task: None,
            lanes: Vec::new(),
            failures: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Scrapes that failed at the transport or HTTP level.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

async fn scrape_once(client: &reqwest::Client, endpoint: &str) -> Result<bytes::Bytes, String> {
    let response = client
        .get(endpoint)
        .send()
        .await
        .map_err(|e| format!("scrape of {endpoint} failed: {e}"))?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("scrape of {endpoint} returned {status}"));
    }
    response
        .bytes()
        .await
        .map_err(|e| format!("reading scrape body from {endpoint} failed: {e}"))
}

impl Receiver for ScrapeReceiver {
    async fn start(&mut self, replicas: Vec<Arc<Replica>>) -> Result<(), ReceiverError> {
        let client = self.client.clone();
        let endpoint = self.settings.endpoint.clone();
        let period = self.settings.interval;
        let stop = self.stop.clone();
        let failures = Arc::clone(&self.failures);
        let (deliveries, lanes) = delivery::spawn(replicas, LANE_CAPACITY, None);
        self.lanes = lanes;
        tracing::info!(endpoint = %endpoint, interval = ?period, "scrape receiver started");

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let body = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    body = scrape_once(&client, &endpoint) => body,
                };
                match body {
                    Ok(body) => deliveries.offer(&body),
                    Err(reason) => {
                        failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(endpoint = %endpoint, error = %reason, "scrape failed");
                        deliveries.record_error(&reason);
                    }
                }
            }
        }));
        Ok(())
    }

    async fn shutdown(&mut self, deadline: Duration) {
        let until = Instant::now() + deadline;
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            join_within(task, deadline, "http_scrape").await;
        }
        delivery::join_lanes(std::mem::take(&mut self.lanes), until, "http_scrape").await;
    }

    fn name(&self) -> &str {
        "http_scrape"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::test_util::{replica, stuck_replica};
    use crate::record::SignalType;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BODY: &str = r#"{"resources":[{"resource":{"host.name":"db-1"},"records":[
        {"type":"metric","time_unix_nano":1,"name":"connections","value":12.0,"aggregation":"gauge"}
    ]}]}"#;

    fn settings(endpoint: String) -> ScrapeSettings {
        ScrapeSettings {
            endpoint,
            interval: Duration::from_millis(50),
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_scrapes_on_interval() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metrics"))
            .respond_with(ResponseTemplate::new(200).set_body_string(BODY))
            .mount(&server)
            .await;

        let (metrics, mut rx) = replica("metrics", SignalType::Metrics);
        let mut receiver = ScrapeReceiver::new(settings(format!("{}/metrics", server.uri()))).unwrap();
        receiver.start(vec![metrics]).await.unwrap();

        for _ in 0..2 {
            let batch = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(batch.records[0].name(), "connections");
            assert_eq!(
                batch.records[0].resource().get("host.name").and_then(|v| v.as_str()),
                Some("db-1")
            );
        }
        receiver.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_stalled_pipeline_does_not_delay_scrapes_for_others() {
        let server = MockServer::start().await;
        Mock::given(path("/metrics"))
            .respond_with(ResponseTemplate::new(200).set_body_string(BODY))
            .mount(&server)
            .await;

        let stalled = stuck_replica("stalled", SignalType::Metrics);
        let (metrics, mut rx) = replica("metrics", SignalType::Metrics);
        let mut receiver = ScrapeReceiver::new(settings(format!("{}/metrics", server.uri()))).unwrap();
        receiver.start(vec![stalled, metrics]).await.unwrap();

        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
        tokio::time::timeout(Duration::from_secs(2), receiver.shutdown(Duration::from_millis(200)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_and_malformed_scrapes_keep_running() {
        let server = MockServer::start().await;
        Mock::given(path("/down"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(path("/garbage"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let (down_replica, _rx1) = replica("metrics", SignalType::Metrics);
        let mut down = ScrapeReceiver::new(settings(format!("{}/down", server.uri()))).unwrap();
        down.start(vec![Arc::clone(&down_replica)]).await.unwrap();

        let (garbage_replica, _rx2) = replica("metrics", SignalType::Metrics);
        let mut garbage = ScrapeReceiver::new(settings(format!("{}/garbage", server.uri()))).unwrap();
        garbage.start(vec![Arc::clone(&garbage_replica)]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(180)).await;
        down.shutdown(Duration::from_secs(1)).await;
        garbage.shutdown(Duration::from_secs(1)).await;

        assert!(down.failures() >= 2);
        assert!(down_replica.health().error_count() >= 2);
        assert_eq!(down_replica.decode_errors(), 0);
        assert!(garbage_replica.decode_errors() >= 2);
        assert_eq!(garbage.failures(), 0);
    }
}
