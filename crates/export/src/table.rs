//! Row and cell model for the legacy table store.
//!
//! The exporter never talks to a concrete table service directly. It reads
//! pages of [`TableRow`]s through the [`TableScan`] port, so the same
//! pipeline runs against a live account, a captured snapshot, or an
//! in-memory double in tests.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Partition key prefix of secondary index rows maintained by the legacy
/// persistence. Index rows carry no saga state and are skipped wholesale.
pub const SECONDARY_INDEX_PREFIX: &str = "Index_";

/// Column on saga data rows that points back at the secondary index entry
/// the row was found through. Its presence marks a row as migratable.
pub const SECONDARY_INDEX_COLUMN: &str = "NServiceBus_2ndIndexKey";

/// Reserved column mirroring the row's partition key.
pub const PARTITION_KEY_COLUMN: &str = "PartitionKey";

/// Reserved column mirroring the row's row key.
pub const ROW_KEY_COLUMN: &str = "RowKey";

/// Opaque resumption point handed back by a [`TableScan`] page.
///
/// The exporter treats the token as a black box and feeds it verbatim into
/// the next page request. Its contents are owned by the scan implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A typed cell as stored by the legacy table service.
///
/// The table store keeps per-column type information that plain JSON cannot
/// express, so cells serialize as a `{"type": ..., "value": ...}` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    String(String),
    #[serde(with = "base64_bytes")]
    Binary(Vec<u8>),
    Boolean(bool),
    Timestamp(DateTime<FixedOffset>),
    Double(f64),
    Guid(Uuid),
    Int32(i32),
    Int64(i64),
}

impl CellValue {
    /// Short name of the stored type, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            CellValue::String(_) => "string",
            CellValue::Binary(_) => "binary",
            CellValue::Boolean(_) => "boolean",
            CellValue::Timestamp(_) => "timestamp",
            CellValue::Double(_) => "double",
            CellValue::Guid(_) => "guid",
            CellValue::Int32(_) => "int32",
            CellValue::Int64(_) => "int64",
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// One row of the legacy saga table: its two keys plus the remaining
/// user columns, keyed by column name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRow {
    pub partition_key: String,
    pub row_key: String,
    #[serde(default)]
    pub cells: BTreeMap<String, CellValue>,
}

impl TableRow {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            cells: BTreeMap::new(),
        }
    }

    /// Adds a cell, replacing any previous value under the same column.
    pub fn with_cell(mut self, column: impl Into<String>, value: CellValue) -> Self {
        self.cells.insert(column.into(), value);
        self
    }

    pub fn cell(&self, column: &str) -> Option<&CellValue> {
        self.cells.get(column)
    }

    /// Whether this row belongs to a secondary index rather than to
    /// saga state proper.
    pub fn is_secondary_index_row(&self) -> bool {
        self.partition_key.starts_with(SECONDARY_INDEX_PREFIX)
    }
}

/// One page of scan results together with the token for the next page,
/// if any.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanPage {
    pub rows: Vec<TableRow>,
    pub continuation: Option<ContinuationToken>,
}

/// Port over a paginated table scan.
///
/// Implementations fetch one page per call and report progress through
/// continuation tokens, mirroring how the legacy table API segments
/// results. The exporter drives the scan sequentially so at most one
/// page request is in flight at a time.
#[async_trait]
pub trait TableScan: Send + Sync {
    /// Backend-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetches the next page of rows.
    ///
    /// # Arguments
    ///
    /// * `continuation` - Token from the previous page, or `None` to start
    ///   from the beginning of the table.
    ///
    /// # Returns
    ///
    /// The page's rows and, when more data remains, the token to pass to
    /// the following call. A page with `continuation: None` ends the scan.
    ///
    /// # Errors
    ///
    /// Any backend failure. The exporter stops scheduling new work on the
    /// first scan error.
    async fn scan_page(
        &self,
        continuation: Option<&ContinuationToken>,
    ) -> Result<ScanPage, Self::Error>;
}
