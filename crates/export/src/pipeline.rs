//! Concurrent export pipeline.
//!
//! One sequential scan drives pages of rows through a bounded pool of
//! per-row transform-and-write tasks. Secondary index rows are filtered
//! out before fan-out, completions stream back to the caller as files
//! land on disk, and the first real failure cancels everything still in
//! flight. There is no partial-success mode: a run either exports every
//! data row or reports the error that stopped it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use crate::error::ExportError;
use crate::projector::ValueProjector;
use crate::table::{ContinuationToken, TableRow, TableScan};
use crate::transform::{IdRemapPolicy, RowTransformer};
use crate::writer::DocumentWriter;

/// Upper bound on concurrently running transform-and-write tasks unless
/// overridden through [`ExportOptions::with_max_concurrency`].
pub const DEFAULT_MAX_CONCURRENCY: usize = 50;

/// Cooperative cancellation flag shared between the exporter and its
/// in-flight tasks.
///
/// Cancelling is sticky: once raised the flag stays raised, and every
/// task checks it before starting expensive work.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Tuning knobs for an export run.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// How many rows may be transformed and written at the same time.
    pub max_concurrency: usize,
    /// What to do with rows that carry no secondary index marker.
    pub id_remap: IdRemapPolicy,
    /// Whether string cells shaped like a quoted JSON string are unwrapped.
    pub sniff_quoted_strings: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            id_remap: IdRemapPolicy::default(),
            sniff_quoted_strings: true,
        }
    }
}

impl ExportOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_id_remap(mut self, policy: IdRemapPolicy) -> Self {
        self.id_remap = policy;
        self
    }

    pub fn with_quoted_string_sniffing(mut self, sniff: bool) -> Self {
        self.sniff_quoted_strings = sniff;
        self
    }
}

/// One successfully exported document.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedDocument {
    /// Document id, which is also the output file stem.
    pub id: String,
    /// Where the file was written.
    pub path: PathBuf,
}

/// Counters and results of a finished run.
#[derive(Debug, Default)]
pub struct ExportSummary {
    /// Pages pulled from the scan.
    pub pages: usize,
    /// Secondary index rows dropped before fan-out.
    pub skipped_index_rows: usize,
    /// Every document written, in completion order.
    pub exported: Vec<ExportedDocument>,
}

impl ExportSummary {
    pub fn exported_count(&self) -> usize {
        self.exported.len()
    }
}

/// Drives a full table export: scan, filter, transform, write.
pub struct TableExporter<S> {
    scan: S,
    writer: DocumentWriter,
    transformer: Arc<RowTransformer>,
    options: ExportOptions,
    cancel: CancelSignal,
}

impl<S> TableExporter<S>
where
    S: TableScan + 'static,
{
    /// Builds an exporter over a scan source and an output directory.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Options`] when `max_concurrency` is zero.
    pub fn new(
        scan: S,
        writer: DocumentWriter,
        options: ExportOptions,
    ) -> Result<Self, ExportError<S::Error>> {
        if options.max_concurrency == 0 {
            return Err(ExportError::Options(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        let transformer = RowTransformer::new(
            options.id_remap,
            ValueProjector::new(options.sniff_quoted_strings),
        );
        Ok(Self {
            scan,
            writer,
            transformer: Arc::new(transformer),
            options,
            cancel: CancelSignal::new(),
        })
    }

    /// Handle for cancelling the run from another task, for instance a
    /// ctrl-c handler.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Runs the export to completion.
    pub async fn run(&self) -> Result<ExportSummary, ExportError<S::Error>> {
        self.run_with_progress(None).await
    }

    /// Runs the export, streaming each finished document through
    /// `progress` as its file lands on disk.
    ///
    /// # Errors
    ///
    /// The first scan, transform or write failure aborts the run and is
    /// returned after in-flight tasks have drained.
    /// [`ExportError::Cancelled`] reports a run stopped through the
    /// cancel signal instead.
    pub async fn run_with_progress(
        &self,
        progress: Option<mpsc::UnboundedSender<ExportedDocument>>,
    ) -> Result<ExportSummary, ExportError<S::Error>> {
        self.writer.prepare().await.map_err(ExportError::Write)?;

        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrency));
        let mut in_flight: FuturesUnordered<
            JoinHandle<Result<ExportedDocument, ExportError<S::Error>>>,
        > = FuturesUnordered::new();
        let mut summary = ExportSummary::default();
        let mut first_error: Option<ExportError<S::Error>> = None;
        let mut continuation: Option<ContinuationToken> = None;

        'scan: loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let page = match self.scan.scan_page(continuation.as_ref()).await {
                Ok(page) => page,
                Err(error) => {
                    first_error = Some(ExportError::Scan(error));
                    break;
                }
            };
            summary.pages += 1;
            debug!(page = summary.pages, rows = page.rows.len(), "scanned page");

            for row in page.rows {
                if row.is_secondary_index_row() {
                    summary.skipped_index_rows += 1;
                    debug!(partition_key = %row.partition_key, "skipped secondary index row");
                    continue;
                }

                // Wait for a free slot, reaping completed tasks while
                // blocked so their results are not held back by a slow
                // sibling.
                let permit = loop {
                    if first_error.is_some() || self.cancel.is_cancelled() {
                        break None;
                    }
                    tokio::select! {
                        acquired = semaphore.clone().acquire_owned() => match acquired {
                            Ok(permit) => break Some(permit),
                            Err(_) => {
                                first_error =
                                    Some(ExportError::Worker("task pool closed".to_string()));
                                break None;
                            }
                        },
                        Some(done) = in_flight.next() => {
                            handle_completion(done, &mut summary, &mut first_error, &self.cancel, progress.as_ref());
                        }
                    }
                };
                let Some(permit) = permit else {
                    break 'scan;
                };

                let transformer = Arc::clone(&self.transformer);
                let writer = self.writer.clone();
                let cancel = self.cancel.clone();
                in_flight.push(tokio::spawn(async move {
                    let _permit = permit;
                    process_row(row, transformer, writer, cancel).await
                }));
            }

            match page.continuation {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        // A failed run takes everything still in flight down with it.
        if first_error.is_some() {
            self.cancel.cancel();
        }
        while let Some(done) = in_flight.next().await {
            handle_completion(done, &mut summary, &mut first_error, &self.cancel, progress.as_ref());
        }

        if let Some(error) = first_error {
            warn!(%error, exported = summary.exported.len(), "export aborted");
            return Err(error);
        }
        if self.cancel.is_cancelled() {
            info!(exported = summary.exported.len(), "export cancelled");
            return Err(ExportError::Cancelled);
        }
        info!(
            pages = summary.pages,
            exported = summary.exported.len(),
            skipped_index_rows = summary.skipped_index_rows,
            "export complete"
        );
        Ok(summary)
    }
}

async fn process_row<E>(
    row: TableRow,
    transformer: Arc<RowTransformer>,
    writer: DocumentWriter,
    cancel: CancelSignal,
) -> Result<ExportedDocument, ExportError<E>> {
    if cancel.is_cancelled() {
        return Err(ExportError::Cancelled);
    }
    let document = transformer.transform(&row).map_err(ExportError::Transform)?;
    if cancel.is_cancelled() {
        return Err(ExportError::Cancelled);
    }
    let path = writer.write(&document).await.map_err(ExportError::Write)?;
    Ok(ExportedDocument {
        id: document.id,
        path,
    })
}

fn handle_completion<E>(
    done: Result<Result<ExportedDocument, ExportError<E>>, JoinError>,
    summary: &mut ExportSummary,
    first_error: &mut Option<ExportError<E>>,
    cancel: &CancelSignal,
    progress: Option<&mpsc::UnboundedSender<ExportedDocument>>,
) {
    match done {
        Ok(Ok(exported)) => {
            if let Some(sender) = progress {
                // A dropped receiver only means nobody is watching.
                let _ = sender.send(exported.clone());
            }
            summary.exported.push(exported);
        }
        // Tasks cut short by cancellation are not failures in their own
        // right; the run already reports why it stopped.
        Ok(Err(error)) if error.is_cancelled() => {}
        Ok(Err(error)) => {
            if first_error.is_none() {
                // Stop in-flight siblings at their next checkpoint instead
                // of letting them write files a failed run cannot vouch for.
                cancel.cancel();
                *first_error = Some(error);
            }
        }
        Err(join_error) => {
            if first_error.is_none() {
                cancel.cancel();
                *first_error = Some(ExportError::Worker(join_error.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{CellValue, ScanPage, SECONDARY_INDEX_COLUMN};
    use async_trait::async_trait;
    use std::io;
    use tempfile::TempDir;

    struct StubScan {
        pages: Vec<Vec<TableRow>>,
        fail_on_page: Option<usize>,
    }

    impl StubScan {
        fn new(pages: Vec<Vec<TableRow>>) -> Self {
            Self {
                pages,
                fail_on_page: None,
            }
        }

        fn failing_on(mut self, page: usize) -> Self {
            self.fail_on_page = Some(page);
            self
        }
    }

    #[async_trait]
    impl TableScan for StubScan {
        type Error = io::Error;

        async fn scan_page(
            &self,
            continuation: Option<&ContinuationToken>,
        ) -> Result<ScanPage, io::Error> {
            let index: usize = match continuation {
                None => 0,
                Some(token) => token
                    .as_str()
                    .parse()
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad token"))?,
            };
            if self.fail_on_page == Some(index) {
                return Err(io::Error::new(io::ErrorKind::Other, "backend unavailable"));
            }
            let rows = self.pages.get(index).cloned().unwrap_or_default();
            let continuation = if index + 1 < self.pages.len() {
                Some(ContinuationToken::new((index + 1).to_string()))
            } else {
                None
            };
            Ok(ScanPage { rows, continuation })
        }
    }

    fn data_row(row_key: &str, order_id: &str) -> TableRow {
        let marker = format!("Index_Samples.OrderSagaData_OrderId_\"{order_id}\"#");
        TableRow::new("Samples.OrderSagaData", row_key)
            .with_cell(SECONDARY_INDEX_COLUMN, CellValue::String(marker))
            .with_cell("OrderId", CellValue::String(order_id.into()))
    }

    fn index_row(n: usize) -> TableRow {
        TableRow::new(format!("Index_Samples.OrderSagaData_OrderId_\"{n}\"#"), "guid")
    }

    fn exporter(
        scan: StubScan,
        dir: &TempDir,
        options: ExportOptions,
    ) -> TableExporter<StubScan> {
        TableExporter::new(scan, DocumentWriter::new(dir.path()), options).unwrap()
    }

    #[tokio::test]
    async fn exports_every_data_row_and_skips_index_rows() {
        let dir = TempDir::new().unwrap();
        let scan = StubScan::new(vec![
            vec![data_row("r1", "order-1"), index_row(1)],
            vec![data_row("r2", "order-2"), data_row("r3", "order-3")],
        ]);

        let summary = exporter(scan, &dir, ExportOptions::default())
            .run()
            .await
            .unwrap();

        assert_eq!(summary.pages, 2);
        assert_eq!(summary.skipped_index_rows, 1);
        assert_eq!(summary.exported_count(), 3);
        for exported in &summary.exported {
            assert!(exported.path.is_file());
            assert_eq!(
                exported.path.file_name().unwrap().to_string_lossy(),
                format!("{}.json", exported.id)
            );
        }
    }

    #[tokio::test]
    async fn scan_failures_abort_with_the_backend_error() {
        let dir = TempDir::new().unwrap();
        let scan = StubScan::new(vec![vec![data_row("r1", "order-1")], vec![]]).failing_on(1);

        let err = exporter(scan, &dir, ExportOptions::default())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, ExportError::Scan(_)));
    }

    #[tokio::test]
    async fn malformed_rows_abort_the_run() {
        let dir = TempDir::new().unwrap();
        let bad = TableRow::new("Samples.OrderSagaData", "r-bad").with_cell(
            SECONDARY_INDEX_COLUMN,
            CellValue::String("Index_not_a_marker".into()),
        );
        let scan = StubScan::new(vec![vec![bad]]);

        let err = exporter(scan, &dir, ExportOptions::default())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, ExportError::Transform(_)));
    }

    #[tokio::test]
    async fn a_raised_cancel_signal_stops_the_run() {
        let dir = TempDir::new().unwrap();
        let scan = StubScan::new(vec![vec![data_row("r1", "order-1")]]);
        let exporter = exporter(scan, &dir, ExportOptions::default());

        exporter.cancel_signal().cancel();
        let err = exporter.run().await.unwrap_err();

        assert!(err.is_cancelled());
    }

    #[test]
    fn the_first_failed_row_raises_the_cancel_signal() {
        let mut summary = ExportSummary::default();
        let mut first_error: Option<ExportError<io::Error>> = None;
        let cancel = CancelSignal::new();

        handle_completion(
            Ok(Err(ExportError::Worker("boom".to_string()))),
            &mut summary,
            &mut first_error,
            &cancel,
            None,
        );

        assert!(cancel.is_cancelled());
        assert!(first_error.is_some());

        // Siblings that then stop early must not displace the real cause.
        handle_completion(
            Ok(Err(ExportError::Cancelled)),
            &mut summary,
            &mut first_error,
            &cancel,
            None,
        );

        assert!(matches!(first_error, Some(ExportError::Worker(_))));
    }

    #[tokio::test]
    async fn zero_concurrency_is_rejected() {
        let dir = TempDir::new().unwrap();
        let scan = StubScan::new(vec![]);

        let err = TableExporter::new(
            scan,
            DocumentWriter::new(dir.path()),
            ExportOptions::default().with_max_concurrency(0),
        )
        .err()
        .unwrap();

        assert!(matches!(err, ExportError::Options(_)));
    }

    #[tokio::test]
    async fn progress_streams_documents_as_they_finish() {
        let dir = TempDir::new().unwrap();
        let scan = StubScan::new(vec![vec![data_row("r1", "order-1"), data_row("r2", "order-2")]]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let summary = exporter(scan, &dir, ExportOptions::default())
            .run_with_progress(Some(tx))
            .await
            .unwrap();

        let mut streamed = Vec::new();
        while let Ok(exported) = rx.try_recv() {
            streamed.push(exported.id);
        }
        streamed.sort();
        let mut expected: Vec<String> =
            summary.exported.iter().map(|e| e.id.clone()).collect();
        expected.sort();
        assert_eq!(streamed, expected);
    }

    #[tokio::test]
    async fn reexporting_into_the_same_directory_succeeds() {
        let dir = TempDir::new().unwrap();
        let pages = vec![vec![data_row("r1", "order-1")]];

        let first = exporter(StubScan::new(pages.clone()), &dir, ExportOptions::default())
            .run()
            .await
            .unwrap();
        let first_bytes = std::fs::read(&first.exported[0].path).unwrap();

        let second = exporter(StubScan::new(pages), &dir, ExportOptions::default())
            .run()
            .await
            .unwrap();

        assert_eq!(first.exported_count(), 1);
        assert_eq!(second.exported_count(), 1);
        assert_eq!(first.exported[0].path, second.exported[0].path);
        // The rerun rewrites the same file with byte-identical content.
        assert_eq!(std::fs::read(&second.exported[0].path).unwrap(), first_bytes);
    }

    #[tokio::test]
    async fn single_slot_concurrency_still_exports_everything() {
        let dir = TempDir::new().unwrap();
        let rows: Vec<TableRow> = (0..10)
            .map(|n| data_row(&format!("r{n}"), &format!("order-{n}")))
            .collect();
        let scan = StubScan::new(vec![rows]);

        let summary = exporter(
            scan,
            &dir,
            ExportOptions::default().with_max_concurrency(1),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(summary.exported_count(), 10);
    }
}
