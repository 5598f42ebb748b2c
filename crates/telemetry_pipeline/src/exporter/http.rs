use super::Exporter;
use crate::batch::Batch;
use crate::error::ExportError;
use crate::wire::encode_batch;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Header carrying `{pipeline}:{sequence}` so receivers can deduplicate retries.
pub const SEQUENCE_HEADER: &str = "x-batch-sequence";

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpSettings {
    pub endpoint: String,
    #[serde(default = "default_timeout", with = "crate::config::duration")]
    pub timeout: Duration,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl HttpSettings {
    pub(crate) fn validate(&self) -> Result<(), String> {
        let url = reqwest::Url::parse(&self.endpoint)
            .map_err(|e| format!("invalid endpoint {:?}: {e}", self.endpoint))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!("endpoint {:?} must use http or https", self.endpoint));
        }
        if self.timeout.is_zero() {
            return Err("timeout must be positive".into());
        }
        header_map(&self.headers)?;
        Ok(())
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, String> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| format!("invalid header name {name:?}"))?;
        let value =
            HeaderValue::from_str(value).map_err(|_| format!("invalid value for header {name}"))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Status codes worth another attempt.
fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

/// POSTs each batch as a JSON envelope.
pub struct HttpExporter {
    client: reqwest::Client,
    endpoint: reqwest::Url,
    headers: HeaderMap,
}

impl HttpExporter {
    pub fn new(settings: &HttpSettings) -> Result<Self, String> {
        let endpoint = reqwest::Url::parse(&settings.endpoint).map_err(|e| e.to_string())?;
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| format!("failed to build http client: {e}"))?;
        Ok(Self {
            client,
            endpoint,
            headers: header_map(&settings.headers)?,
        })
    }
}

impl Exporter for HttpExporter {
    async fn export(&self, batch: Arc<Batch>) -> Result<(), ExportError> {
        let body = encode_batch(&batch).map_err(|e| ExportError::Permanent(e.to_string()))?;
        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(SEQUENCE_HEADER, format!("{}:{}", batch.pipeline, batch.sequence))
            .body(body)
            .send()
            .await
            .map_err(|e| ExportError::Retryable(format!("request to {} failed: {e}", self.endpoint)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        let reason = if text.is_empty() {
            status.to_string()
        } else {
            format!("{status}: {text}")
        };
        if is_retryable_status(status) {
            Err(ExportError::Retryable(reason))
        } else {
            Err(ExportError::Permanent(reason))
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::test_util::log;
    use crate::wire::decode;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(endpoint: String) -> HttpSettings {
        HttpSettings {
            endpoint,
            timeout: Duration::from_secs(2),
            headers: BTreeMap::from([("x-tenant".to_string(), "acme".to_string())]),
        }
    }

    fn batch() -> Arc<Batch> {
        let mut batch = Batch::new(vec![log("hello")]);
        batch.pipeline = Arc::from("logs");
        batch.sequence = 3;
        Arc::new(batch)
    }

    #[tokio::test]
    async fn test_posts_envelope_with_sequence_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/logs"))
            .and(header(SEQUENCE_HEADER, "logs:3"))
            .and(header("x-tenant", "acme"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let exporter = HttpExporter::new(&settings(format!("{}/v1/logs", server.uri()))).unwrap();
        exporter.export(batch()).await.unwrap();

        let received = server.received_requests().await.unwrap();
        let records = decode(&received[0].body).unwrap();
        assert_eq!(records[0].name(), "hello");
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(path("/busy"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(path("/bad"))
            .respond_with(ResponseTemplate::new(400).set_body_string("malformed"))
            .mount(&server)
            .await;

        let busy = HttpExporter::new(&settings(format!("{}/busy", server.uri()))).unwrap();
        assert!(matches!(busy.export(batch()).await, Err(ExportError::Retryable(_))));

        let bad = HttpExporter::new(&settings(format!("{}/bad", server.uri()))).unwrap();
        match bad.export(batch()).await {
            Err(ExportError::Permanent(reason)) => assert!(reason.contains("malformed")),
            other => panic!("expected permanent error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let exporter = HttpExporter::new(&settings(format!("http://{addr}/"))).unwrap();
        assert!(exporter.export(batch()).await.unwrap_err().is_retryable());
    }

    #[test]
    fn test_validate() {
        assert!(settings("http://localhost:4318/v1".into()).validate().is_ok());
        assert!(settings("localhost:4318".into()).validate().is_err());
        let mut bad_header = settings("http://localhost/".into());
        bad_header.headers.insert("bad header".into(), "x".into());
        assert!(bad_header.validate().is_err());
    }

    #[test]
    fn test_retryable_statuses() {
        for code in [408, 429, 502, 503, 504] {
            assert!(is_retryable_status(StatusCode::from_u16(code).unwrap()));
        }
        for code in [400, 401, 404, 500] {
            assert!(!is_retryable_status(StatusCode::from_u16(code).unwrap()));
        }
    }
}
