//! In-memory implementation of TableScan for testing.

use async_trait::async_trait;
use sagastore_export::{ContinuationToken, ScanPage, TableRow, TableScan};

/// In-memory table scan implementation.
///
/// Serves a fixed row list in pages and issues offset continuation tokens
/// the way a real table endpoint segments results. Rows come back in the
/// order they were supplied.
#[derive(Debug, Clone)]
pub struct InMemoryTableScan {
    rows: Vec<TableRow>,
    page_size: usize,
}

impl InMemoryTableScan {
    /// Create a scan over the given rows.
    ///
    /// `page_size` is clamped to at least one row per page.
    pub fn new(rows: Vec<TableRow>, page_size: usize) -> Self {
        Self {
            rows,
            page_size: page_size.max(1),
        }
    }

    /// Number of rows the scan will serve.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Error type for InMemoryTableScan operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InMemoryScanError {
    #[error("Continuation token {0:?} was not issued by this scan")]
    UnknownContinuation(String),
}

#[async_trait]
impl TableScan for InMemoryTableScan {
    type Error = InMemoryScanError;

    async fn scan_page(
        &self,
        continuation: Option<&ContinuationToken>,
    ) -> Result<ScanPage, Self::Error> {
        let offset = match continuation {
            None => 0,
            Some(token) => token.as_str().parse::<usize>().map_err(|_| {
                InMemoryScanError::UnknownContinuation(token.as_str().to_string())
            })?,
        };
        if offset > self.rows.len() {
            return Err(InMemoryScanError::UnknownContinuation(offset.to_string()));
        }

        let end = (offset + self.page_size).min(self.rows.len());
        let rows = self.rows[offset..end].to_vec();
        let continuation = (end < self.rows.len()).then(|| ContinuationToken::new(end.to_string()));
        Ok(ScanPage { rows, continuation })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(row_key: &str) -> TableRow {
        TableRow::new("Samples.OrderSagaData", row_key)
    }

    #[tokio::test]
    async fn test_pages_walk_the_rows_in_order() {
        let scan = InMemoryTableScan::new(vec![row("r1"), row("r2"), row("r3")], 2);

        let first = scan.scan_page(None).await.unwrap();
        assert_eq!(first.rows.len(), 2);
        assert_eq!(first.rows[0].row_key, "r1");
        let token = first.continuation.unwrap();

        let second = scan.scan_page(Some(&token)).await.unwrap();
        assert_eq!(second.rows.len(), 1);
        assert_eq!(second.rows[0].row_key, "r3");
        assert!(second.continuation.is_none());
    }

    #[tokio::test]
    async fn test_empty_scan_yields_one_empty_page() {
        let scan = InMemoryTableScan::new(Vec::new(), 10);

        let page = scan.scan_page(None).await.unwrap();

        assert!(page.rows.is_empty());
        assert!(page.continuation.is_none());
    }

    #[tokio::test]
    async fn test_foreign_tokens_are_rejected() {
        let scan = InMemoryTableScan::new(vec![row("r1")], 10);

        let err = scan
            .scan_page(Some(&ContinuationToken::new("not-a-number")))
            .await
            .unwrap_err();

        assert!(matches!(err, InMemoryScanError::UnknownContinuation(_)));
    }

    #[tokio::test]
    async fn test_zero_page_size_still_makes_progress() {
        let scan = InMemoryTableScan::new(vec![row("r1"), row("r2")], 0);

        let page = scan.scan_page(None).await.unwrap();

        assert_eq!(page.rows.len(), 1);
        assert!(page.continuation.is_some());
    }
}
