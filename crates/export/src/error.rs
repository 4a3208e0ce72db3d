//! Error types for the export pipeline.
//!
//! [`ExportError`] is generic over the scan backend's error so transport
//! failures keep their original type; row-level problems get their own
//! enums and fold in at the pipeline boundary.

use std::path::PathBuf;

/// A row could not be turned into a saga document.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// The secondary index marker did not match the expected shape.
    #[error("row {row_key:?} carries a malformed secondary index marker: {marker}")]
    MalformedIndexMarker {
        /// Row the marker came from.
        row_key: String,
        /// The raw marker text, or a description of the non-string cell.
        marker: String,
    },

    /// Id remapping was required but the row has no marker to derive from.
    #[error("row {row_key:?} carries no secondary index marker but id remapping requires one")]
    MissingIndexMarker {
        /// The marker-less row.
        row_key: String,
    },
}

/// A document could not be written to disk.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// The per-table output directory could not be created or inspected.
    #[error("failed to prepare export directory {path:?}")]
    CreateDir {
        /// The directory in question.
        path: PathBuf,
        /// Underlying io error.
        source: std::io::Error,
    },

    /// Writing a document file failed.
    #[error("failed to write {path:?}")]
    Io {
        /// The file in question.
        path: PathBuf,
        /// Underlying io error.
        source: std::io::Error,
    },

    /// Serializing a document failed.
    #[error("failed to serialize document {id}")]
    Serialize {
        /// Id of the document.
        id: String,
        /// Underlying serializer error.
        source: serde_json::Error,
    },
}

/// Errors that abort an export run.
///
/// The first row failure cancels the whole run; partially written output
/// may remain on disk and a rerun overwrites it file by file.
#[derive(Debug, thiserror::Error)]
pub enum ExportError<E> {
    /// The scan backend failed to deliver a page.
    #[error("table scan failed: {0}")]
    Scan(E),

    /// A row could not be transformed.
    #[error(transparent)]
    Transform(TransformError),

    /// A document could not be written.
    #[error(transparent)]
    Write(WriteError),

    /// The exporter was configured with unusable options.
    #[error("invalid export options: {0}")]
    Options(String),

    /// The run was cancelled before it finished.
    #[error("export cancelled")]
    Cancelled,

    /// A row worker task failed outside its own error path.
    #[error("export worker failed: {0}")]
    Worker(String),
}

impl<E> ExportError<E> {
    /// Check if this is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl<E> From<E> for ExportError<E> {
    fn from(err: E) -> Self {
        ExportError::Scan(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("scan broke")]
    struct FakeScanError;

    #[test]
    fn scan_errors_convert_via_from() {
        let err: ExportError<FakeScanError> = FakeScanError.into();
        assert!(matches!(err, ExportError::Scan(_)));
        assert!(!err.is_cancelled());
    }

    #[test]
    fn transform_errors_name_the_row() {
        let err = TransformError::MissingIndexMarker {
            row_key: "row-1".to_string(),
        };
        assert!(err.to_string().contains("row-1"));
    }

    #[test]
    fn write_errors_chain_their_source() {
        let err = WriteError::Io {
            path: PathBuf::from("/tmp/out/x.json"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(std::error::Error::source(&err).is_some());
    }
}
