//! Push receiver: length-delimited JSON envelopes over TCP.
//!
//! Each connection is served by its own task, which reads one frame at a
//! time and offers it to every replica's delivery lane, so frames of one
//! connection reach each pipeline in order. Decodes across all lanes share
//! a pool of `decode_workers` permits.

use super::delivery::{self, Deliveries, LANE_CAPACITY};
use super::{join_within, Receiver, Replica};
use crate::error::{DecodeError, ReceiverError};
use crate::exporter::stream::{frame_codec, DEFAULT_MAX_FRAME_LENGTH};
use futures::StreamExt;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

fn default_max_frame_length() -> usize {
    DEFAULT_MAX_FRAME_LENGTH
}

fn default_max_connections() -> usize {
    64
}

fn default_decode_workers() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamSettings {
    /// Listen address, `host:port`.
    pub endpoint: String,
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_decode_workers")]
    pub decode_workers: usize,
}

impl StreamSettings {
    pub(crate) fn validate(&self) -> Result<(), String> {
        self.endpoint
            .parse::<SocketAddr>()
            .map_err(|e| format!("endpoint {:?} is not a socket address: {e}", self.endpoint))?;
        if self.max_frame_length == 0 {
            return Err("max_frame_length must be positive".into());
        }
        if self.max_connections == 0 {
            return Err("max_connections must be at least 1".into());
        }
        if self.decode_workers == 0 {
            return Err("decode_workers must be at least 1".into());
        }
        Ok(())
    }
}

pub struct StreamReceiver {
    settings: StreamSettings,
    local_addr: Option<SocketAddr>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
    lanes: Vec<JoinHandle<()>>,
}

impl StreamReceiver {
    pub fn new(settings: StreamSettings) -> Self {
        Self {
            settings,
            local_addr: None,
            stop: CancellationToken::new(),
            task: None,
            lanes: Vec::new(),
        }
    }
}

impl Receiver for StreamReceiver {
    async fn start(&mut self, replicas: Vec<Arc<Replica>>) -> Result<(), ReceiverError> {
        let addr: SocketAddr = self
            .settings
            .endpoint
            .parse()
            .map_err(|e: std::net::AddrParseError| ReceiverError::InvalidEndpoint {
                endpoint: self.settings.endpoint.clone(),
                reason: e.to_string(),
            })?;
        let listener = TcpListener::bind(addr).await.map_err(|source| ReceiverError::Bind {
            endpoint: self.settings.endpoint.clone(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| ReceiverError::Bind {
            endpoint: self.settings.endpoint.clone(),
            source,
        })?;
        self.local_addr = Some(local_addr);
        tracing::info!(endpoint = %local_addr, replicas = replicas.len(), "stream receiver listening");

        let decoders = Arc::new(Semaphore::new(self.settings.decode_workers));
        let (deliveries, lanes) = delivery::spawn(replicas, LANE_CAPACITY, Some(decoders));
        self.lanes = lanes;
        let server = Server {
            deliveries,
            connections: Arc::new(Semaphore::new(self.settings.max_connections)),
            max_frame_length: self.settings.max_frame_length,
            stop: self.stop.clone(),
        };
        self.task = Some(tokio::spawn(server.accept_loop(listener)));
        Ok(())
    }

    async fn shutdown(&mut self, deadline: Duration) {
        let until = Instant::now() + deadline;
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            join_within(task, deadline, "stream").await;
        }
        delivery::join_lanes(std::mem::take(&mut self.lanes), until, "stream").await;
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn name(&self) -> &str {
        "stream"
    }
}

struct Server {
    deliveries: Deliveries,
    connections: Arc<Semaphore>,
    max_frame_length: usize,
    stop: CancellationToken,
}

impl Server {
    async fn accept_loop(self, listener: TcpListener) {
        let mut connections = JoinSet::new();
        loop {
            let permit = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                permit = Arc::clone(&self.connections).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let accepted = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                accepted = listener.accept() => accepted,
                // Reap finished connections while waiting.
                Some(_) = connections.join_next(), if !connections.is_empty() => continue,
            };
            match accepted {
                Ok((socket, peer)) => {
                    tracing::debug!(peer = %peer, "stream connection accepted");
                    let connection = Connection {
                        deliveries: self.deliveries.clone(),
                        stop: self.stop.clone(),
                    };
                    let max_frame_length = self.max_frame_length;
                    connections.spawn(async move {
                        connection.serve(socket, max_frame_length).await;
                        drop(permit);
                    });
                }
                Err(e) => tracing::warn!(error = %e, "stream accept failed"),
            }
        }
        drop(listener);

        // Let open connections hand off the frame they are reading.
        while connections.join_next().await.is_some() {}
        tracing::debug!("stream receiver stopped");
    }
}

struct Connection {
    deliveries: Deliveries,
    stop: CancellationToken,
}

impl Connection {
    async fn serve(self, socket: TcpStream, max_frame_length: usize) {
        let mut frames = FramedRead::new(socket, frame_codec(max_frame_length));
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return,
                frame = frames.next() => frame,
            };
            match frame {
                Some(Ok(payload)) => self.deliveries.offer(&payload.freeze()),
                Some(Err(e)) => {
                    self.deliveries.record_decode_error(&DecodeError::Framing(e.to_string()));
                    return;
                }
                None => return,
            }
        }
    }
}
