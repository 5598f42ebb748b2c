use super::Exporter;
use crate::batch::Batch;
use crate::error::ExportError;
use crate::wire::encode_records;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    /// One summary line per batch.
    #[default]
    Basic,
    /// Summary plus one JSON line per record.
    Detailed,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DebugSettings {
    #[serde(default)]
    pub verbosity: Verbosity,
}

/// Stdout exporter for testing and debugging
pub struct DebugExporter {
    verbosity: Verbosity,
}

impl DebugExporter {
    pub fn new(verbosity: Verbosity) -> Self {
        Self { verbosity }
    }

    fn render(&self, batch: &Batch) -> Result<String, ExportError> {
        let mut text = format!(
            "=== pipeline={} sequence={} records={} ===",
            batch.pipeline,
            batch.sequence,
            batch.len()
        );
        if self.verbosity == Verbosity::Detailed {
            for record in &batch.records {
                let line = encode_records(std::slice::from_ref(record))
                    .map_err(|e| ExportError::Permanent(e.to_string()))?;
                text.push('\n');
                text.push_str(&String::from_utf8_lossy(&line));
            }
        }
        Ok(text)
    }
}

impl Exporter for DebugExporter {
    async fn export(&self, batch: Arc<Batch>) -> Result<(), ExportError> {
        println!("{}", self.render(&batch)?);
        Ok(())
    }

    fn name(&self) -> &str {
        "debug"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::test_util::log;

    #[test]
    fn test_render_verbosity() {
        let mut batch = Batch::new(vec![log("hello"), log("world")]);
        batch.sequence = 7;
        batch.pipeline = Arc::from("logs");

        let basic = DebugExporter::new(Verbosity::Basic).render(&batch).unwrap();
        assert_eq!(basic, "=== pipeline=logs sequence=7 records=2 ===");

        let detailed = DebugExporter::new(Verbosity::Detailed).render(&batch).unwrap();
        assert_eq!(detailed.lines().count(), 3);
        assert!(detailed.contains("\"body\":\"world\""));
    }
}
