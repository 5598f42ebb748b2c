use super::Exporter;
use crate::batch::Batch;
use crate::error::ExportError;
use crate::wire::encode_batch;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSettings {
    pub path: PathBuf,
}

/// Appends one JSON envelope per batch, one batch per line.
pub struct FileExporter {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileExporter {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            file: Mutex::new(None),
        }
    }
}

impl Exporter for FileExporter {
    async fn export(&self, batch: Arc<Batch>) -> Result<(), ExportError> {
        let mut line = encode_batch(&batch).map_err(|e| ExportError::Permanent(e.to_string()))?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| ExportError::Retryable(format!("open {}: {e}", self.path.display())))?;
            *guard = Some(file);
        }
        let Some(file) = guard.as_mut() else {
            return Err(ExportError::Retryable("file handle unavailable".into()));
        };
        let written = match file.write_all(&line).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            // Reopen on the next attempt.
            *guard = None;
            return Err(ExportError::Retryable(format!("write {}: {e}", self.path.display())));
        }
        Ok(())
    }

    async fn shutdown(&self) {
        if let Some(file) = self.file.lock().await.take()
            && let Err(e) = file.sync_all().await
        {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to sync export file");
        }
    }

    fn name(&self) -> &str {
        "file"
    }
}
