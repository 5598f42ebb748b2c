use super::Exporter;
use crate::batch::Batch;
use crate::error::ExportError;
use crate::wire::encode_batch;
use bytes::Bytes;
use futures::SinkExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

pub(crate) const DEFAULT_MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

fn default_max_frame_length() -> usize {
    DEFAULT_MAX_FRAME_LENGTH
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamExporterSettings {
    /// `host:port` of the downstream stream receiver.
    pub endpoint: String,
    #[serde(default, with = "crate::config::duration::option")]
    pub connect_timeout: Option<Duration>,
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
}

impl StreamExporterSettings {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.endpoint.rsplit_once(':').is_none_or(|(host, port)| {
            host.is_empty() || port.parse::<u16>().is_err()
        }) {
            return Err(format!("endpoint {:?} must be host:port", self.endpoint));
        }
        if self.max_frame_length == 0 {
            return Err("max_frame_length must be positive".into());
        }
        Ok(())
    }
}

pub(crate) fn frame_codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_length)
        .new_codec()
}

type Connection = Framed<TcpStream, LengthDelimitedCodec>;

/// Pushes each batch as one length-delimited frame over a TCP connection.
///
/// The connection is opened on first use and reopened after a send failure.
pub struct StreamExporter {
    endpoint: String,
    connect_timeout: Option<Duration>,
    max_frame_length: usize,
    connection: Mutex<Option<Connection>>,
}

impl StreamExporter {
    pub fn new(settings: &StreamExporterSettings) -> Self {
        Self {
            endpoint: settings.endpoint.clone(),
            connect_timeout: settings.connect_timeout,
            max_frame_length: settings.max_frame_length,
            connection: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<Connection, ExportError> {
        let connecting = TcpStream::connect(&self.endpoint);
        let stream = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connecting)
                .await
                .map_err(|_| ExportError::Retryable(format!("connect to {} timed out", self.endpoint)))?,
            None => connecting.await,
        }
        .map_err(|e| ExportError::Retryable(format!("connect to {}: {e}", self.endpoint)))?;
        stream.set_nodelay(true).ok();
        Ok(Framed::new(stream, frame_codec(self.max_frame_length)))
    }
}

impl Exporter for StreamExporter {
    async fn export(&self, batch: Arc<Batch>) -> Result<(), ExportError> {
        let payload = encode_batch(&batch).map_err(|e| ExportError::Permanent(e.to_string()))?;
        if payload.len() > self.max_frame_length {
            return Err(ExportError::Permanent(format!(
                "encoded batch of {} bytes exceeds max_frame_length {}",
                payload.len(),
                self.max_frame_length
            )));
        }

        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(connection) = guard.as_mut() else {
            return Err(ExportError::Retryable("connection unavailable".into()));
        };
        if let Err(e) = connection.send(Bytes::from(payload)).await {
            *guard = None;
            return Err(ExportError::Retryable(format!("send to {}: {e}", self.endpoint)));
        }
        Ok(())
    }

    async fn shutdown(&self) {
        if let Some(mut connection) = self.connection.lock().await.take()
            && let Err(e) = SinkExt::<Bytes>::close(&mut connection).await
        {
            tracing::debug!(endpoint = %self.endpoint, error = %e, "stream close failed");
        }
    }

    fn name(&self) -> &str {
        "stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::test_util::log;
    use crate::wire::decode;
    use futures::StreamExt;
    use tokio::net::TcpListener;

    fn settings(endpoint: String) -> StreamExporterSettings {
        StreamExporterSettings {
            endpoint,
            connect_timeout: Some(Duration::from_secs(1)),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    #[tokio::test]
    async fn test_sends_frames_on_one_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut frames = Framed::new(socket, frame_codec(DEFAULT_MAX_FRAME_LENGTH));
            let mut names = Vec::new();
            while let Some(frame) = frames.next().await {
                for record in decode(&frame.unwrap()).unwrap() {
                    names.push(record.name().to_string());
                }
            }
            names
        });

        let exporter = StreamExporter::new(&settings(addr.to_string()));
        exporter.export(Arc::new(Batch::new(vec![log("a"), log("b")]))).await.unwrap();
        exporter.export(Arc::new(Batch::new(vec![log("c")]))).await.unwrap();
        exporter.shutdown().await;

        assert_eq!(server.await.unwrap(), ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_oversized_batch_is_permanent() {
        let exporter = StreamExporter::new(&StreamExporterSettings {
            max_frame_length: 16,
            ..settings("127.0.0.1:1".into())
        });
        let err = exporter.export(Arc::new(Batch::new(vec![log("a")]))).await.unwrap_err();
        assert!(matches!(err, ExportError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_retryable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let exporter = StreamExporter::new(&settings(addr.to_string()));
        let err = exporter.export(Arc::new(Batch::new(vec![log("a")]))).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_validate_endpoint() {
        assert!(settings("collector:4317".into()).validate().is_ok());
        assert!(settings("collector".into()).validate().is_err());
        assert!(settings(":4317".into()).validate().is_err());
    }
}
