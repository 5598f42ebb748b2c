//! Validated component graph.
//!
//! Components live in per-section arenas; pipelines refer to them by index.
//! Building the registry checks every reference and collects every problem
//! before reporting, so one run of `validate` shows all of them.

use crate::component::{ComponentId, Section};
use crate::config::{Config, Options, ServiceSettings};
use crate::error::{ValidationError, ValidationErrors};
use crate::exporter::ExporterSettings;
use crate::processor::ProcessorSettings;
use crate::receiver::ReceiverSettings;
use crate::record::SignalType;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub const DEFAULT_QUEUE_SIZE: usize = 128;

/// Failure parsing one component's options.
#[derive(Debug)]
pub enum SettingsError {
    UnknownType,
    Invalid(String),
}

impl From<String> for SettingsError {
    fn from(reason: String) -> Self {
        SettingsError::Invalid(reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReceiverIdx(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessorIdx(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExporterIdx(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineIdx(pub usize);

#[derive(Debug)]
pub struct Node<S> {
    pub id: ComponentId,
    pub settings: S,
    /// Pipelines referencing this component, in pipeline order.
    pub pipelines: Vec<PipelineIdx>,
}

#[derive(Debug, Clone)]
pub struct PipelineSpec {
    pub name: Arc<str>,
    pub signal: SignalType,
    pub receivers: Vec<ReceiverIdx>,
    pub processors: Vec<ProcessorIdx>,
    pub exporters: Vec<ExporterIdx>,
    pub queue_size: usize,
}

#[derive(Debug)]
pub struct Registry {
    pub receivers: Vec<Node<ReceiverSettings>>,
    pub processors: Vec<Node<ProcessorSettings>>,
    pub exporters: Vec<Node<ExporterSettings>>,
    pub pipelines: Vec<PipelineSpec>,
    pub service: ServiceSettings,
}

/// Arena under construction for one section.
struct Arena<S> {
    section: Section,
    nodes: Vec<Node<S>>,
    index: BTreeMap<String, usize>,
    /// Ids present in the document but rejected; references to them are not
    /// reported a second time.
    rejected: BTreeSet<String>,
}

impl<S> Arena<S> {
    fn build(
        section: Section,
        entries: &BTreeMap<String, Options>,
        parse: impl Fn(&str, &Options) -> Result<S, SettingsError>,
        errors: &mut Vec<ValidationError>,
    ) -> Self {
        let mut arena = Self {
            section,
            nodes: Vec::new(),
            index: BTreeMap::new(),
            rejected: BTreeSet::new(),
        };
        for (raw, options) in entries {
            let id: ComponentId = match raw.parse() {
                Ok(id) => id,
                Err(_) => {
                    errors.push(ValidationError::InvalidId {
                        section,
                        id: raw.clone(),
                    });
                    arena.rejected.insert(raw.clone());
                    continue;
                }
            };
            match parse(id.kind(), options) {
                Ok(settings) => {
                    arena.index.insert(raw.clone(), arena.nodes.len());
                    arena.nodes.push(Node {
                        id,
                        settings,
                        pipelines: Vec::new(),
                    });
                }
                Err(SettingsError::UnknownType) => {
                    errors.push(ValidationError::UnknownType {
                        section,
                        id: raw.clone(),
                        kind: id.kind().to_string(),
                    });
                    arena.rejected.insert(raw.clone());
                }
                Err(SettingsError::Invalid(reason)) => {
                    errors.push(ValidationError::InvalidOptions {
                        section,
                        id: raw.clone(),
                        reason,
                    });
                    arena.rejected.insert(raw.clone());
                }
            }
        }
        arena
    }

    /// Resolves pipeline references, collapsing duplicates when `dedupe`.
    fn resolve(
        &self,
        pipeline: &str,
        refs: &[String],
        dedupe: bool,
        errors: &mut Vec<ValidationError>,
    ) -> Vec<usize> {
        let mut resolved = Vec::with_capacity(refs.len());
        for raw in refs {
            match self.index.get(raw) {
                Some(&i) => {
                    if resolved.contains(&i) {
                        if dedupe {
                            continue;
                        }
                        errors.push(ValidationError::DuplicateProcessor {
                            pipeline: pipeline.to_string(),
                            id: raw.clone(),
                        });
                        continue;
                    }
                    resolved.push(i);
                }
                None if self.rejected.contains(raw) => {}
                None => errors.push(ValidationError::UnknownReference {
                    pipeline: pipeline.to_string(),
                    section: self.section,
                    id: raw.clone(),
                }),
            }
        }
        resolved
    }
}

impl Registry {
    pub fn build(config: &Config) -> Result<Self, ValidationErrors> {
        let mut errors = Vec::new();
        if config.pipelines.is_empty() {
            errors.push(ValidationError::NoPipelines);
        }

        let mut receivers = Arena::build(Section::Receiver, &config.receivers, ReceiverSettings::parse, &mut errors);
        let mut processors = Arena::build(Section::Processor, &config.processors, ProcessorSettings::parse, &mut errors);
        let mut exporters = Arena::build(Section::Exporter, &config.exporters, ExporterSettings::parse, &mut errors);

        let mut pipelines = Vec::with_capacity(config.pipelines.len());
        for (name, pipeline) in &config.pipelines {
            if pipeline.receivers.is_empty() {
                errors.push(ValidationError::EmptySection {
                    pipeline: name.clone(),
                    section: Section::Receiver,
                });
            }
            if pipeline.exporters.is_empty() {
                errors.push(ValidationError::EmptySection {
                    pipeline: name.clone(),
                    section: Section::Exporter,
                });
            }
            if pipeline.queue_size == Some(0) {
                errors.push(ValidationError::InvalidPipeline {
                    pipeline: name.clone(),
                    reason: "queue_size must be at least 1".into(),
                });
            }

            let receiver_idx = receivers.resolve(name, &pipeline.receivers, true, &mut errors);
            let processor_idx = processors.resolve(name, &pipeline.processors, false, &mut errors);
            let exporter_idx = exporters.resolve(name, &pipeline.exporters, true, &mut errors);

            for &p in &processor_idx {
                let node = &processors.nodes[p];
                if !node.settings.supports(pipeline.signal_type) {
                    errors.push(ValidationError::UnsupportedSignal {
                        pipeline: name.clone(),
                        id: node.id.to_string(),
                        signal: pipeline.signal_type,
                    });
                }
                if let ProcessorSettings::Routing(routing) = &node.settings {
                    for target in routing.referenced_exporters() {
                        let in_pipeline = exporter_idx
                            .iter()
                            .any(|&e| &exporters.nodes[e].id == target);
                        if !in_pipeline {
                            errors.push(ValidationError::RouteOutsidePipeline {
                                pipeline: name.clone(),
                                id: node.id.to_string(),
                                exporter: target.to_string(),
                            });
                        }
                    }
                }
            }

            let idx = PipelineIdx(pipelines.len());
            for &r in &receiver_idx {
                receivers.nodes[r].pipelines.push(idx);
            }
            for &p in &processor_idx {
                processors.nodes[p].pipelines.push(idx);
            }
            for &e in &exporter_idx {
                exporters.nodes[e].pipelines.push(idx);
            }
            pipelines.push(PipelineSpec {
                name: Arc::from(name.as_str()),
                signal: pipeline.signal_type,
                receivers: receiver_idx.into_iter().map(ReceiverIdx).collect(),
                processors: processor_idx.into_iter().map(ProcessorIdx).collect(),
                exporters: exporter_idx.into_iter().map(ExporterIdx).collect(),
                queue_size: pipeline.queue_size.unwrap_or(DEFAULT_QUEUE_SIZE),
            });
        }

        if !errors.is_empty() {
            return Err(ValidationErrors(errors));
        }

        warn_unused(Section::Receiver, &receivers.nodes);
        warn_unused(Section::Processor, &processors.nodes);
        warn_unused(Section::Exporter, &exporters.nodes);

        Ok(Self {
            receivers: receivers.nodes,
            processors: processors.nodes,
            exporters: exporters.nodes,
            pipelines,
            service: config.service.clone(),
        })
    }

    pub fn receiver(&self, idx: ReceiverIdx) -> &Node<ReceiverSettings> {
        &self.receivers[idx.0]
    }

    pub fn processor(&self, idx: ProcessorIdx) -> &Node<ProcessorSettings> {
        &self.processors[idx.0]
    }

    pub fn exporter(&self, idx: ExporterIdx) -> &Node<ExporterSettings> {
        &self.exporters[idx.0]
    }

    pub fn pipeline(&self, idx: PipelineIdx) -> &PipelineSpec {
        &self.pipelines[idx.0]
    }
}

fn warn_unused<S>(section: Section, nodes: &[Node<S>]) {
    for node in nodes.iter().filter(|n| n.pipelines.is_empty()) {
        tracing::warn!(section = %section, component = %node.id, "component is not used by any pipeline");
    }
}
