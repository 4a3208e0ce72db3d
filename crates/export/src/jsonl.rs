//! File-backed scan source: one table row per JSON line.
//!
//! A JSONL snapshot stands in for a live table account. Operators dump
//! the legacy table once, then run the export against the dump as many
//! times as they need to get the working directory right.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::table::{ContinuationToken, ScanPage, TableRow, TableScan};

/// Errors reading or paging a JSONL snapshot.
#[derive(Debug, thiserror::Error)]
pub enum JsonlScanError {
    /// The snapshot file could not be read.
    #[error("failed to read snapshot {path:?}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A line of the snapshot is not a table row.
    #[error("snapshot line {line} is not a table row")]
    Parse {
        line: usize,
        source: serde_json::Error,
    },

    /// The continuation token did not come from this scan.
    #[error("continuation token {token:?} was not issued by this scan")]
    InvalidContinuation { token: String },
}

/// Paginated scan over an in-memory snapshot loaded from a JSONL file.
///
/// The whole snapshot is parsed up front so malformed rows surface
/// before any file is written. Continuation tokens are row offsets.
#[derive(Debug)]
pub struct JsonlTableScan {
    rows: Vec<TableRow>,
    page_size: usize,
}

impl JsonlTableScan {
    /// Loads and validates a snapshot file.
    ///
    /// # Errors
    ///
    /// [`JsonlScanError::Io`] when the file cannot be read and
    /// [`JsonlScanError::Parse`] for the first line that is not a table
    /// row, with its 1-based line number.
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self, JsonlScanError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| JsonlScanError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, page_size)
    }

    /// Parses snapshot content already in memory. Blank lines are
    /// skipped; a zero page size is clamped to one.
    pub fn parse(content: &str, page_size: usize) -> Result<Self, JsonlScanError> {
        let mut rows = Vec::new();
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let row: TableRow =
                serde_json::from_str(line).map_err(|source| JsonlScanError::Parse {
                    line: index + 1,
                    source,
                })?;
            rows.push(row);
        }
        Ok(Self {
            rows,
            page_size: page_size.max(1),
        })
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

#[async_trait]
impl TableScan for JsonlTableScan {
    type Error = JsonlScanError;

    async fn scan_page(
        &self,
        continuation: Option<&ContinuationToken>,
    ) -> Result<ScanPage, JsonlScanError> {
        let offset = match continuation {
            None => 0,
            Some(token) => token.as_str().parse::<usize>().map_err(|_| {
                JsonlScanError::InvalidContinuation {
                    token: token.as_str().to_string(),
                }
            })?,
        };
        if offset > self.rows.len() {
            return Err(JsonlScanError::InvalidContinuation {
                token: offset.to_string(),
            });
        }

        let end = usize::min(offset + self.page_size, self.rows.len());
        let rows = self.rows[offset..end].to_vec();
        let continuation =
            (end < self.rows.len()).then(|| ContinuationToken::new(end.to_string()));
        Ok(ScanPage { rows, continuation })
    }
}
