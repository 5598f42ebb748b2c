//! In-memory representation of telemetry records.
//!
//! A [`Record`] is one span, metric point or log entry. The resource and the
//! instrumentation scope are shared, immutable handles attached once when a
//! receiver decodes a message; the per-record `attributes` map stays mutable
//! until the record is handed to an exporter inside a shared [`Batch`].
//!
//! [`Batch`]: crate::batch::Batch

use crate::usage::Lease;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// The three telemetry signals a pipeline can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Traces,
    Metrics,
    Logs,
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalType::Traces => "traces",
            SignalType::Metrics => "metrics",
            SignalType::Logs => "logs",
        };
        f.write_str(name)
    }
}

/// Attribute value types for record and resource metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<AttributeValue>),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(b) => write!(f, "{b}"),
            AttributeValue::Int(i) => write!(f, "{i}"),
            AttributeValue::Float(v) => write!(f, "{v}"),
            AttributeValue::String(s) => f.write_str(s),
            AttributeValue::Array(values) => {
                f.write_str("[")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

/// Insertion-ordered attribute map.
pub type Attributes = IndexMap<String, AttributeValue>;

/// Attributes describing the producing process. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource {
    attributes: BTreeMap<String, AttributeValue>,
}

impl Resource {
    pub fn new(attributes: BTreeMap<String, AttributeValue>) -> Self {
        Self { attributes }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<AttributeValue>,
    {
        Self {
            attributes: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    pub fn attributes(&self) -> &BTreeMap<String, AttributeValue> {
        &self.attributes
    }
}

/// Name and version of the library that produced a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentationScope {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl InstrumentationScope {
    pub fn new(name: impl Into<String>, version: Option<&str>) -> Self {
        Self {
            name: name.into(),
            version: version.map(str::to_string),
        }
    }
}

macro_rules! fixed_width_id {
    ($name:ident, $len:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            /// All-zero ids are reserved as "invalid".
            pub fn is_valid(&self) -> bool {
                self.0.iter().any(|b| *b != 0)
            }

            pub fn from_hex(text: &str) -> Result<Self, String> {
                let bytes = hex::decode(text).map_err(|e| e.to_string())?;
                let bytes: [u8; $len] = bytes.try_into().map_err(|v: Vec<u8>| {
                    format!("expected {} bytes, got {}", $len, v.len())
                })?;
                Ok(Self(bytes))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;
                Self::from_hex(&text).map_err(serde::de::Error::custom)
            }
        }
    };
}

fixed_width_id!(TraceId, 16, "16-byte trace identifier, hex encoded on the wire.");
fixed_width_id!(SpanId, 8, "8-byte span identifier, hex encoded on the wire.");

/// Span kind according to OpenTelemetry specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    #[default]
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

/// Span execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    #[default]
    Unset,
    Ok,
    Error,
}

/// Log severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    Gauge,
    Sum,
    MonotonicSum,
    HistogramCount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanData {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<SpanId>,
    pub name: String,
    #[serde(default)]
    pub kind: SpanKind,
    #[serde(default)]
    pub status: SpanStatus,
    pub end_time_unix_nano: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub name: String,
    pub value: f64,
    pub aggregation: AggregationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub severity: Severity,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<SpanId>,
}

/// Signal-specific part of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordBody {
    Span(SpanData),
    Metric(MetricPoint),
    Log(LogEntry),
}

/// A single span, metric point or log entry.
#[derive(Debug, Clone)]
pub struct Record {
    resource: Arc<Resource>,
    scope: Arc<InstrumentationScope>,
    /// Start time for spans, observation time otherwise (Unix nanoseconds)
    pub timestamp: u64,
    pub attributes: Attributes,
    pub body: RecordBody,
    /// Accounting handle; clones start unaccounted.
    pub(crate) lease: Lease,
}

impl Record {
    pub fn new(
        resource: Arc<Resource>,
        scope: Arc<InstrumentationScope>,
        timestamp: u64,
        body: RecordBody,
    ) -> Self {
        Self {
            resource,
            scope,
            timestamp,
            attributes: Attributes::new(),
            body,
            lease: Lease::default(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }

    pub fn scope(&self) -> &Arc<InstrumentationScope> {
        &self.scope
    }

    pub fn signal(&self) -> SignalType {
        match self.body {
            RecordBody::Span(_) => SignalType::Traces,
            RecordBody::Metric(_) => SignalType::Metrics,
            RecordBody::Log(_) => SignalType::Logs,
        }
    }

    pub fn as_span(&self) -> Option<&SpanData> {
        match &self.body {
            RecordBody::Span(span) => Some(span),
            _ => None,
        }
    }

    /// Span name, metric name or log body.
    pub fn name(&self) -> &str {
        match &self.body {
            RecordBody::Span(span) => &span.name,
            RecordBody::Metric(point) => &point.name,
            RecordBody::Log(entry) => &entry.body,
        }
    }

    /// Duration of a span; `None` for other signals.
    pub fn duration(&self) -> Option<Duration> {
        self.as_span()
            .map(|span| Duration::from_nanos(span.end_time_unix_nano.saturating_sub(self.timestamp)))
    }

    pub fn severity(&self) -> Option<Severity> {
        match &self.body {
            RecordBody::Log(entry) => Some(entry.severity),
            _ => None,
        }
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.resource == other.resource
            && self.scope == other.scope
            && self.timestamp == other.timestamp
            && self.attributes == other.attributes
            && self.body == other.body
    }
}

/// Current wall clock as Unix nanoseconds.
pub fn now_unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_round_trip_as_hex() {
        let trace_id = TraceId([0xab; 16]);
        let json = serde_json::to_string(&trace_id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(16)));
        let back: TraceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, trace_id);
    }

    #[test]
    fn test_id_with_wrong_width_is_rejected() {
        let result: Result<SpanId, _> = serde_json::from_str("\"abcd\"");
        assert!(result.is_err());
        assert!(!SpanId::default().is_valid());
    }

    #[test]
    fn test_record_signal_and_duration() {
        let record = Record::new(
            Arc::new(Resource::from_pairs([("service.name", "checkout")])),
            Arc::new(InstrumentationScope::new("io.checkout", Some("1.0"))),
            1_000,
            RecordBody::Span(SpanData {
                trace_id: TraceId([1; 16]),
                span_id: SpanId([2; 8]),
                parent_span_id: None,
                name: "GET /cart".into(),
                kind: SpanKind::Server,
                status: SpanStatus::Ok,
                end_time_unix_nano: 5_000,
            }),
        );
        assert_eq!(record.signal(), SignalType::Traces);
        assert_eq!(record.duration(), Some(Duration::from_nanos(4_000)));
        assert_eq!(record.name(), "GET /cart");
        assert_eq!(
            record.resource().get("service.name"),
            Some(&AttributeValue::from("checkout"))
        );
    }

    #[test]
    fn test_attribute_value_untagged_parsing() {
        let values: Vec<AttributeValue> = serde_json::from_str(r#"[true, 5, 2.5, "x"]"#).unwrap();
        assert_eq!(
            values,
            vec![
                AttributeValue::Bool(true),
                AttributeValue::Int(5),
                AttributeValue::Float(2.5),
                AttributeValue::String("x".into()),
            ]
        );
    }
}
