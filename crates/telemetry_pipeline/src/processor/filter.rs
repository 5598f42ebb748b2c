//! Filter processor - keeps records matching a predicate tree.

use super::{Emitter, Processor, ProcessorContext};
use crate::batch::Batch;
use crate::error::ProcessorError;
use crate::record::{AttributeValue, Record, Severity};
use regex::Regex;
use serde::Deserialize;
use std::time::Duration;

/// Predicate tree as written in configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Predicate {
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
    AttributeEquals { key: String, value: AttributeValue },
    AttributeExists { key: String },
    AttributeMatches { key: String, pattern: String },
    ResourceEquals { key: String, value: AttributeValue },
    NameMatches { pattern: String },
    SeverityAtLeast(Severity),
    MinDuration(#[serde(with = "crate::config::duration")] Duration),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterSettings {
    pub keep: Predicate,
}

impl FilterSettings {
    pub(crate) fn validate(&self) -> Result<(), String> {
        Matcher::compile(&self.keep).map(|_| ())
    }
}

/// Compiled predicate.
#[derive(Debug)]
enum Matcher {
    All(Vec<Matcher>),
    Any(Vec<Matcher>),
    Not(Box<Matcher>),
    AttributeEquals(String, AttributeValue),
    AttributeExists(String),
    AttributeMatches(String, Regex),
    ResourceEquals(String, AttributeValue),
    NameMatches(Regex),
    SeverityAtLeast(Severity),
    MinDuration(Duration),
}

fn regex(pattern: &str) -> Result<Regex, String> {
    Regex::new(pattern).map_err(|e| format!("invalid pattern `{pattern}`: {e}"))
}

impl Matcher {
    fn compile(predicate: &Predicate) -> Result<Self, String> {
        Ok(match predicate {
            Predicate::All(items) => {
                Matcher::All(items.iter().map(Matcher::compile).collect::<Result<_, _>>()?)
            }
            Predicate::Any(items) => {
                Matcher::Any(items.iter().map(Matcher::compile).collect::<Result<_, _>>()?)
            }
            Predicate::Not(inner) => Matcher::Not(Box::new(Matcher::compile(inner)?)),
            Predicate::AttributeEquals { key, value } => {
                Matcher::AttributeEquals(key.clone(), value.clone())
            }
            Predicate::AttributeExists { key } => Matcher::AttributeExists(key.clone()),
            Predicate::AttributeMatches { key, pattern } => {
                Matcher::AttributeMatches(key.clone(), regex(pattern)?)
            }
            Predicate::ResourceEquals { key, value } => {
                Matcher::ResourceEquals(key.clone(), value.clone())
            }
            Predicate::NameMatches { pattern } => Matcher::NameMatches(regex(pattern)?),
            Predicate::SeverityAtLeast(level) => Matcher::SeverityAtLeast(*level),
            Predicate::MinDuration(min) => Matcher::MinDuration(*min),
        })
    }

    fn matches(&self, record: &Record) -> bool {
        match self {
            Matcher::All(items) => items.iter().all(|m| m.matches(record)),
            Matcher::Any(items) => items.iter().any(|m| m.matches(record)),
            Matcher::Not(inner) => !inner.matches(record),
            Matcher::AttributeEquals(key, value) => record.attributes.get(key) == Some(value),
            Matcher::AttributeExists(key) => record.attributes.contains_key(key),
            Matcher::AttributeMatches(key, re) => record
                .attributes
                .get(key)
                .is_some_and(|v| re.is_match(&v.to_string())),
            Matcher::ResourceEquals(key, value) => record.resource().get(key) == Some(value),
            Matcher::NameMatches(re) => re.is_match(record.name()),
            // Non-log records have no severity and never match.
            Matcher::SeverityAtLeast(level) => record.severity().is_some_and(|s| s >= *level),
            Matcher::MinDuration(min) => record.duration().is_some_and(|d| d >= *min),
        }
    }
}

pub struct FilterProcessor {
    keep: Matcher,
    ctx: ProcessorContext,
}

impl FilterProcessor {
    pub fn new(settings: &FilterSettings, ctx: ProcessorContext) -> Result<Self, String> {
        Ok(Self {
            keep: Matcher::compile(&settings.keep)?,
            ctx,
        })
    }
}

impl Processor for FilterProcessor {
    async fn process(&mut self, mut batch: Batch, out: &mut Emitter) -> Result<(), ProcessorError> {
        let before = batch.len();
        batch.records.retain(|r| self.keep.matches(r));
        let dropped = (before - batch.len()) as u64;
        if dropped > 0 {
            self.ctx.metrics.record_dropped(dropped);
            tracing::debug!(pipeline = %self.ctx.pipeline, component = %self.ctx.id, dropped, "records filtered");
        }
        out.emit(batch).await
    }

    fn name(&self) -> &str {
        "filter"
    }
}
