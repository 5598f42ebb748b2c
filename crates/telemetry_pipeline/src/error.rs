//! Error taxonomy.
//!
//! Only [`ValidationErrors`] (and failing to bind a listener at start) stop
//! the service. Every other error is recovered where it happens, counted and
//! recorded as the owning component's most recent error.

use crate::component::{InvalidTransition, Section};
use crate::record::SignalType;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors reading or parsing the configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config document: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// A problem with the component graph, detected before any data flows.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{section} id `{id}` is not of the form `type` or `type/name`")]
    InvalidId { section: Section, id: String },
    #[error("{section} `{id}` has unknown type `{kind}`")]
    UnknownType {
        section: Section,
        id: String,
        kind: String,
    },
    #[error("{section} `{id}`: {reason}")]
    InvalidOptions {
        section: Section,
        id: String,
        reason: String,
    },
    #[error("pipeline `{pipeline}` references undefined {section} `{id}`")]
    UnknownReference {
        pipeline: String,
        section: Section,
        id: String,
    },
    #[error("pipeline `{pipeline}` must reference at least one {section}")]
    EmptySection { pipeline: String, section: Section },
    #[error("pipeline `{pipeline}` lists processor `{id}` more than once")]
    DuplicateProcessor { pipeline: String, id: String },
    #[error("processor `{id}` cannot run in {signal} pipeline `{pipeline}`")]
    UnsupportedSignal {
        pipeline: String,
        id: String,
        signal: SignalType,
    },
    #[error("routing processor `{id}` in pipeline `{pipeline}` targets exporter `{exporter}` which the pipeline does not use")]
    RouteOutsidePipeline {
        pipeline: String,
        id: String,
        exporter: String,
    },
    #[error("pipeline `{pipeline}`: {reason}")]
    InvalidPipeline { pipeline: String, reason: String },
    #[error("no pipelines configured")]
    NoPipelines,
}

/// Every validation problem found in one configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} configuration error(s)", self.0.len())?;
        for error in &self.0 {
            write!(f, "\n  - {error}")?;
        }
        Ok(())
    }
}

/// A malformed inbound message. Local to that message.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid record: {0}")]
    Invalid(String),
    #[error("framing error: {0}")]
    Framing(String),
}

/// Failure inside one processor stage. Drops the batch in flight only.
#[derive(Debug, Clone, Error)]
pub enum ProcessorError {
    #[error("processor `{processor}` panicked")]
    Panicked { processor: String },
    #[error("processor `{processor}` received {signal} records")]
    UnsupportedSignal {
        processor: String,
        signal: SignalType,
    },
    #[error("processor `{processor}` failed: {reason}")]
    Failed { processor: String, reason: String },
    #[error("downstream stage closed")]
    DownstreamClosed,
    #[error("cancelled by shutdown")]
    Cancelled,
}

/// Outcome of a failed export attempt.
#[derive(Debug, Clone, Error)]
pub enum ExportError {
    /// Transient failure; the batch may be sent again.
    #[error("retryable export failure: {0}")]
    Retryable(String),
    /// The destination rejected the batch; sending it again cannot help.
    #[error("permanent export failure: {0}")]
    Permanent(String),
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
    #[error("export cancelled by shutdown")]
    Cancelled,
}

impl ExportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExportError::Retryable(_))
    }
}

/// Admission refused by a memory limiter or a full intake queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceExhaustion {
    #[error("memory limit reached ({usage}/{limit} records buffered)")]
    MemoryLimit { usage: u64, limit: u64 },
    #[error("intake queue of pipeline `{pipeline}` is full")]
    QueueFull { pipeline: String },
    #[error("delivery backlog for pipeline `{pipeline}` is full")]
    DeliveryBacklog { pipeline: String },
}

/// Why a sink refused a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error(transparent)]
    Exhausted(#[from] ResourceExhaustion),
    #[error("pipeline intake is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("{0}")]
    Setup(String),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Validation(#[from] ValidationErrors),
    #[error("receiver `{id}` failed to start: {source}")]
    Receiver {
        id: String,
        #[source]
        source: ReceiverError,
    },
    #[error("exporter `{id}` failed to start: {reason}")]
    Exporter { id: String, reason: String },
    #[error("processor `{id}` failed to start: {reason}")]
    Processor { id: String, reason: String },
    #[error(transparent)]
    Lifecycle(#[from] InvalidTransition),
}
