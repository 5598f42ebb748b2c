//! Telemetry Pipeline
//!
//! A standalone service that ingests spans, metric points and log entries
//! from many producers, runs them through ordered processor chains and
//! fans the results out to independent exporters.
//!
//! ```text
//! receiver ─┬─► replica ─► intake ─► stage … stage ─► fan-out ─┬─► exporter queue ─► backend
//!           └─► replica ─► intake ─► …                         └─► exporter queue ─► backend
//! ```
//!
//! The graph is read from YAML ([`Config`]), validated as a whole
//! ([`Registry`]) and run by a [`Service`].
//!
//! # Rust 2024 Edition Features
//!
//! This crate uses native async traits (no `#[async_trait]` macro). Each
//! trait has a `*Boxed` object-safe twin with a blanket implementation.

pub mod batch;
pub mod component;
pub mod config;
pub mod error;
pub mod exporter;
pub mod metrics;
mod pipeline;
pub mod processor;
pub mod receiver;
pub mod record;
pub mod registry;
pub mod service;
pub mod usage;
pub mod wire;

// Re-export main types
pub use batch::{Batch, Route};
pub use component::{ComponentId, ComponentState, Section};
pub use config::Config;
pub use error::{
    ConfigError, DecodeError, ExportError, ProcessorError, ReceiverError, ResourceExhaustion,
    ServiceError, SinkError, ValidationError, ValidationErrors,
};
pub use exporter::{Exporter, ExporterBoxed};
pub use metrics::{HealthSummary, PipelineSnapshot, Telemetry};
pub use processor::{Emitter, Processor, ProcessorBoxed};
pub use receiver::{NullSink, Producer, Receiver, ReceiverBoxed, RecordSink, ScheduledCallback};
pub use record::{
    AttributeValue, InstrumentationScope, Record, RecordBody, Resource, Severity, SignalType,
    SpanStatus,
};
pub use registry::Registry;
pub use service::{Service, ShutdownReport};
