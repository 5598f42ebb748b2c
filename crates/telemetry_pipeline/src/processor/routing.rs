use super::{Emitter, Processor, ProcessorContext};
use crate::batch::{Batch, Route};
use crate::component::ComponentId;
use crate::error::ProcessorError;
use crate::record::Record;
use indexmap::IndexMap;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteSource {
    #[default]
    Attributes,
    Resource,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteEntry {
    pub value: String,
    pub exporters: Vec<ComponentId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingSettings {
    pub attribute: String,
    #[serde(default)]
    pub from: RouteSource,
    pub table: Vec<RouteEntry>,
    pub default_exporters: Vec<ComponentId>,
}

impl RoutingSettings {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.default_exporters.is_empty() {
            return Err("default_exporters must not be empty".into());
        }
        for entry in &self.table {
            if entry.exporters.is_empty() {
                return Err(format!("route `{}` has no exporters", entry.value));
            }
        }
        Ok(())
    }

    /// Every exporter the table can select.
    pub fn referenced_exporters(&self) -> impl Iterator<Item = &ComponentId> {
        self.table
            .iter()
            .flat_map(|e| e.exporters.iter())
            .chain(self.default_exporters.iter())
    }
}

/// Selects an exporter subset per record from one attribute.
pub struct RoutingProcessor {
    attribute: String,
    from: RouteSource,
    table: HashMap<String, Route>,
    default: Route,
    ctx: ProcessorContext,
}

impl RoutingProcessor {
    pub fn new(settings: &RoutingSettings, ctx: ProcessorContext) -> Self {
        Self {
            attribute: settings.attribute.clone(),
            from: settings.from,
            table: settings
                .table
                .iter()
                .map(|e| (e.value.clone(), Route::to(e.exporters.clone())))
                .collect(),
            default: Route::to(settings.default_exporters.clone()),
            ctx,
        }
    }

    fn route_for(&self, record: &Record) -> &Route {
        let value = match self.from {
            RouteSource::Attributes => record.attributes.get(&self.attribute),
            RouteSource::Resource => record.resource().get(&self.attribute),
        };
        value
            .and_then(|v| self.table.get(&v.to_string()))
            .unwrap_or(&self.default)
    }
}

impl Processor for RoutingProcessor {
    async fn process(&mut self, batch: Batch, out: &mut Emitter) -> Result<(), ProcessorError> {
        // Groups in order of first appearance.
        let mut groups: IndexMap<Route, Vec<Record>> = IndexMap::new();
        for record in batch.records {
            let route = self.route_for(&record).clone();
            groups.entry(route).or_default().push(record);
        }
        tracing::trace!(pipeline = %self.ctx.pipeline, routes = groups.len(), "batch routed");
        for (route, records) in groups {
            out.emit(Batch::routed(records, route)).await?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "routing"
    }
}
