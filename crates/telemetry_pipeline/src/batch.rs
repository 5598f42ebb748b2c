use crate::component::ComponentId;
use crate::record::Record;
use std::sync::Arc;

/// Exporter subset selected for a batch. The default route means "every
/// exporter of the pipeline".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Route(Option<Arc<[ComponentId]>>);

impl Route {
    pub fn to(exporters: Vec<ComponentId>) -> Self {
        Self(Some(exporters.into()))
    }

    pub fn is_default(&self) -> bool {
        self.0.is_none()
    }

    pub fn includes(&self, exporter: &ComponentId) -> bool {
        match &self.0 {
            None => true,
            Some(ids) => ids.contains(exporter),
        }
    }

    pub fn exporters(&self) -> Option<&[ComponentId]> {
        self.0.as_deref()
    }
}

/// Ordered group of records moving through one pipeline.
///
/// `sequence` and `pipeline` are stamped when the batch leaves the
/// processor chain; exporters receive it behind an `Arc` and can no longer
/// change it.
#[derive(Debug, Clone)]
pub struct Batch {
    pub records: Vec<Record>,
    pub route: Route,
    pub sequence: u64,
    pub pipeline: Arc<str>,
}

impl Default for Batch {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            route: Route::default(),
            sequence: 0,
            pipeline: Arc::from(""),
        }
    }
}

impl Batch {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    pub fn routed(records: Vec<Record>, route: Route) -> Self {
        Self {
            records,
            route,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
