//! # sagastore-export
//!
//! One-off migration tooling: exports a legacy table-store saga table into
//! the JSON documents `sagastore-core` reads, remapping row identities to
//! the deterministic saga id scheme along the way.
//!
//! ## Architecture
//!
//! The pipeline is a sequential scan fanned out into bounded concurrent
//! per-row work:
//!
//! 1. [`table::TableScan`] pulls pages of rows from the source.
//! 2. Secondary index rows (partition key prefixed `Index_`) are dropped.
//! 3. [`transform::RowTransformer`] strips reserved columns, resolves the
//!    document id from the row's secondary index marker and projects the
//!    remaining typed cells to JSON.
//! 4. [`writer::DocumentWriter`] lands one pretty-printed `{id}.json`
//!    file per document.
//!
//! The first failure anywhere cancels the run; there is no
//! partial-success mode.
//!
//! ## Modules
//!
//! - [`table`]: row and cell model plus the scan port
//! - [`jsonl`]: snapshot-file implementation of the scan port
//! - [`projector`]: typed cell to JSON value projection
//! - [`transform`]: row to saga document transformation
//! - [`writer`]: output directory handling
//! - [`pipeline`]: the concurrent export driver
//! - [`error`]: error types of the above
//!
//! ## Usage
//!
//! ```no_run
//! use sagastore_export::{DocumentWriter, ExportOptions, JsonlTableScan, TableExporter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let scan = JsonlTableScan::open("table.jsonl", 1000)?;
//!     let writer = DocumentWriter::new("./exported");
//!     let exporter = TableExporter::new(scan, writer, ExportOptions::default())?;
//!
//!     let summary = exporter.run().await?;
//!     println!("exported {} documents", summary.exported_count());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod jsonl;
pub mod pipeline;
pub mod projector;
pub mod table;
pub mod transform;
pub mod writer;

pub use error::{ExportError, TransformError, WriteError};
pub use jsonl::{JsonlScanError, JsonlTableScan};
pub use pipeline::{
    CancelSignal, ExportOptions, ExportSummary, ExportedDocument, TableExporter,
    DEFAULT_MAX_CONCURRENCY,
};
pub use projector::ValueProjector;
pub use table::{
    CellValue, ContinuationToken, ScanPage, TableRow, TableScan, PARTITION_KEY_COLUMN,
    ROW_KEY_COLUMN, SECONDARY_INDEX_COLUMN, SECONDARY_INDEX_PREFIX,
};
pub use transform::{IdRemapPolicy, RowTransformer, TransformedDocument};
pub use writer::DocumentWriter;
