//! Output side of the export: one pretty-printed JSON file per document.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use crate::error::WriteError;
use crate::transform::TransformedDocument;

/// Writes transformed documents into a working directory, one `{id}.json`
/// file each.
///
/// Writes are idempotent. Re-exporting into the same directory overwrites
/// the files of the previous run id by id, so a run that aborted halfway
/// can simply be started again.
#[derive(Debug, Clone)]
pub struct DocumentWriter {
    directory: PathBuf,
}

impl DocumentWriter {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Creates the working directory if it does not exist yet.
    ///
    /// An existing non-empty directory is accepted but logged, since files
    /// from an earlier run will be overwritten.
    pub async fn prepare(&self) -> Result<(), WriteError> {
        fs::create_dir_all(&self.directory)
            .await
            .map_err(|source| WriteError::CreateDir {
                path: self.directory.clone(),
                source,
            })?;

        if let Ok(mut entries) = fs::read_dir(&self.directory).await {
            if entries.next_entry().await.ok().flatten().is_some() {
                warn!(
                    directory = %self.directory.display(),
                    "export directory is not empty, existing files may be overwritten"
                );
            }
        }
        Ok(())
    }

    /// Writes one document and returns the path of the file produced.
    pub async fn write(&self, document: &TransformedDocument) -> Result<PathBuf, WriteError> {
        let path = self.directory.join(format!("{}.json", document.id));
        let bytes =
            serde_json::to_vec_pretty(&document.document).map_err(|source| WriteError::Serialize {
                id: document.id.clone(),
                source,
            })?;
        fs::write(&path, bytes)
            .await
            .map_err(|source| WriteError::Io {
                path: path.clone(),
                source,
            })?;
        debug!(path = %path.display(), "wrote saga document");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn document(id: &str, body: serde_json::Value) -> TransformedDocument {
        TransformedDocument {
            id: id.to_string(),
            document: body,
        }
    }

    #[tokio::test]
    async fn writes_a_pretty_json_file_named_by_the_document_id() {
        let dir = TempDir::new().unwrap();
        let writer = DocumentWriter::new(dir.path());
        writer.prepare().await.unwrap();

        let path = writer
            .write(&document("saga-1", json!({"id": "saga-1", "ItemCount": 3})))
            .await
            .unwrap();

        assert_eq!(path.file_name().unwrap(), "saga-1.json");
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains('\n'));
        let back: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert_eq!(back, json!({"id": "saga-1", "ItemCount": 3}));
    }

    #[tokio::test]
    async fn prepare_creates_nested_directories() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("runs").join("2024-01-01");
        let writer = DocumentWriter::new(&nested);

        writer.prepare().await.unwrap();
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn rewriting_the_same_id_overwrites_the_file() {
        let dir = TempDir::new().unwrap();
        let writer = DocumentWriter::new(dir.path());
        writer.prepare().await.unwrap();

        writer
            .write(&document("saga-1", json!({"Version": 1})))
            .await
            .unwrap();
        let path = writer
            .write(&document("saga-1", json!({"Version": 2})))
            .await
            .unwrap();

        let back: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, json!({"Version": 2}));
    }

    #[tokio::test]
    async fn prepare_fails_when_the_path_is_a_file() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("already-a-file");
        std::fs::write(&blocker, b"x").unwrap();

        let err = DocumentWriter::new(&blocker).prepare().await.unwrap_err();
        assert!(matches!(err, WriteError::CreateDir { .. }));
    }
}
