//! JSON envelope shared by the push/pull receivers and the encoding exporters.
//!
//! ```json
//! {"resources":[{"resource":{"service.name":"checkout"},
//!                "scope":{"name":"io.checkout","version":"1.0"},
//!                "records":[{"type":"log","time_unix_nano":1,"body":"hi"}]}]}
//! ```
//!
//! Encoding is deterministic: records are grouped by (resource, scope) in
//! order of first appearance and attribute maps keep insertion order, so
//! identical batches always produce identical bytes.

use crate::batch::Batch;
use crate::error::DecodeError;
use crate::record::{Attributes, InstrumentationScope, Record, RecordBody, Resource};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    resources: Vec<ResourceRecords>,
}

#[derive(Debug, Deserialize)]
struct ResourceRecords {
    #[serde(default)]
    resource: Resource,
    #[serde(default)]
    scope: InstrumentationScope,
    #[serde(default)]
    records: Vec<WireRecord>,
}

#[derive(Debug, Deserialize)]
struct WireRecord {
    time_unix_nano: u64,
    #[serde(default)]
    attributes: Attributes,
    #[serde(flatten)]
    body: RecordBody,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    resources: Vec<ResourceRecordsRef<'a>>,
}

#[derive(Serialize)]
struct ResourceRecordsRef<'a> {
    resource: &'a Resource,
    scope: &'a InstrumentationScope,
    records: Vec<WireRecordRef<'a>>,
}

#[derive(Serialize)]
struct WireRecordRef<'a> {
    time_unix_nano: u64,
    #[serde(skip_serializing_if = "Attributes::is_empty")]
    attributes: &'a Attributes,
    #[serde(flatten)]
    body: &'a RecordBody,
}

/// Decodes one envelope. The resource and scope of each group are attached
/// to its records once, as shared handles.
pub fn decode(payload: &[u8]) -> Result<Vec<Record>, DecodeError> {
    let envelope: Envelope = serde_json::from_slice(payload)?;
    let mut records = Vec::new();
    for group in envelope.resources {
        let resource = Arc::new(group.resource);
        let scope = Arc::new(group.scope);
        for wire in group.records {
            validate(&wire.body)?;
            let mut record = Record::new(
                Arc::clone(&resource),
                Arc::clone(&scope),
                wire.time_unix_nano,
                wire.body,
            );
            record.attributes = wire.attributes;
            records.push(record);
        }
    }
    Ok(records)
}

fn validate(body: &RecordBody) -> Result<(), DecodeError> {
    if let RecordBody::Span(span) = body {
        if !span.trace_id.is_valid() {
            return Err(DecodeError::Invalid(format!(
                "span `{}` has an all-zero trace id",
                span.name
            )));
        }
        if !span.span_id.is_valid() {
            return Err(DecodeError::Invalid(format!(
                "span `{}` has an all-zero span id",
                span.name
            )));
        }
    }
    Ok(())
}

pub fn encode_records(records: &[Record]) -> Result<Vec<u8>, serde_json::Error> {
    let mut groups: Vec<ResourceRecordsRef<'_>> = Vec::new();
    for record in records {
        let wire = WireRecordRef {
            time_unix_nano: record.timestamp,
            attributes: &record.attributes,
            body: &record.body,
        };
        let resource = record.resource().as_ref();
        let scope = record.scope().as_ref();
        match groups
            .iter_mut()
            .find(|g| g.resource == resource && g.scope == scope)
        {
            Some(group) => group.records.push(wire),
            None => groups.push(ResourceRecordsRef {
                resource,
                scope,
                records: vec![wire],
            }),
        }
    }
    serde_json::to_vec(&EnvelopeRef { resources: groups })
}

pub fn encode_batch(batch: &Batch) -> Result<Vec<u8>, serde_json::Error> {
    encode_records(&batch.records)
}
