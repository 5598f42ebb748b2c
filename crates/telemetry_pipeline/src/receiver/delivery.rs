//! Per-replica delivery lanes.
//!
//! A receiver offers every payload to each replica's bounded lane without
//! waiting. One task per lane decodes and injects, so a pipeline whose
//! intake blocks only holds up its own lane. Once a lane is full, payloads
//! for that replica are refused while its siblings keep flowing.
//!
//! ```text
//!              ┌─► lane(replica A) ─► decode ─► intake A
//! receiver ────┤
//!              └─► lane(replica B) ─► decode ─► intake B
//! ```

use super::{join_within, Replica};
use crate::error::DecodeError;
use crate::record::Record;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Payloads buffered per replica before it starts refusing.
pub(crate) const LANE_CAPACITY: usize = 64;

pub(crate) enum Payload {
    /// Raw envelope, decoded by each lane on its own.
    Encoded(Bytes),
    Decoded(Vec<Record>),
}

struct Lane {
    replica: Arc<Replica>,
    queue: mpsc::Sender<Payload>,
}

/// Sending side of every lane of one receiver. Lanes close once every clone
/// is dropped.
#[derive(Clone)]
pub(crate) struct Deliveries {
    lanes: Arc<[Lane]>,
}

/// Spawns one lane task per replica. `decoders` bounds concurrent decodes
/// across all lanes.
pub(crate) fn spawn(
    replicas: Vec<Arc<Replica>>,
    capacity: usize,
    decoders: Option<Arc<Semaphore>>,
) -> (Deliveries, Vec<JoinHandle<()>>) {
    let mut lanes = Vec::with_capacity(replicas.len());
    let mut tasks = Vec::with_capacity(replicas.len());
    for replica in replicas {
        let (queue, rx) = mpsc::channel(capacity);
        tasks.push(tokio::spawn(run_lane(Arc::clone(&replica), rx, decoders.clone())));
        lanes.push(Lane { replica, queue });
    }
    (Deliveries { lanes: lanes.into() }, tasks)
}

impl Deliveries {
    pub(crate) fn offer(&self, payload: &Bytes) {
        for lane in self.lanes.iter() {
            push(lane, Payload::Encoded(payload.clone()));
        }
    }

    pub(crate) fn offer_records(&self, records: &[Record]) {
        for lane in self.lanes.iter() {
            push(lane, Payload::Decoded(records.to_vec()));
        }
    }

    pub(crate) fn record_decode_error(&self, error: &DecodeError) {
        for lane in self.lanes.iter() {
            lane.replica.record_decode_error(error);
        }
    }

    pub(crate) fn record_error(&self, reason: &str) {
        for lane in self.lanes.iter() {
            lane.replica.health().record_error(reason);
        }
    }
}

fn push(lane: &Lane, payload: Payload) {
    match lane.queue.try_send(payload) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => lane.replica.record_overflow(),
        // The lane task was aborted by a forced stop.
        Err(TrySendError::Closed(_)) => {}
    }
}

async fn run_lane(replica: Arc<Replica>, mut queue: mpsc::Receiver<Payload>, decoders: Option<Arc<Semaphore>>) {
    while let Some(payload) = queue.recv().await {
        let records = match payload {
            Payload::Decoded(records) => records,
            Payload::Encoded(bytes) => {
                let decoded = {
                    let _permit = match &decoders {
                        Some(pool) => pool.acquire().await.ok(),
                        None => None,
                    };
                    replica.decode(&bytes)
                };
                match decoded {
                    Some(records) => records,
                    None => continue,
                }
            }
        };
        replica.inject(records).await;
    }
    tracing::trace!(pipeline = %replica.pipeline(), "delivery lane closed");
}

/// Waits for every lane to drain its queue, sharing the budget up to `until`.
pub(crate) async fn join_lanes(tasks: Vec<JoinHandle<()>>, until: Instant, component: &str) {
    for task in tasks {
        join_within(task, until.saturating_duration_since(Instant::now()), component).await;
    }
}
