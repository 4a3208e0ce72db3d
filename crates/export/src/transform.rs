//! Row-to-document transformation.
//!
//! Each data row becomes one saga document. Reserved columns are stripped,
//! the secondary index marker (when the row carries one) yields the
//! deterministic saga id plus migration metadata, and the remaining cells
//! are projected to JSON under their original column names.

use once_cell::sync::Lazy;
use regex::Regex;
use sagastore_core::{
    SagaIdGenerator, SagaMetadata, DOCUMENT_ID_KEY, FULL_TYPE_NAME_KEY, METADATA_KEY,
    MIGRATED_SAGA_ID_KEY, SCHEMA_VERSION_KEY,
};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::TransformError;
use crate::projector::ValueProjector;
use crate::table::{
    CellValue, TableRow, PARTITION_KEY_COLUMN, ROW_KEY_COLUMN, SECONDARY_INDEX_COLUMN,
};

// The marker format joins its three parts with the same `_` the type name
// may itself contain, so the split is anchored at the quoted value: the
// property is the last underscore-free segment before it and every earlier
// segment belongs to the type name.
static INDEX_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r##"^Index_(?P<entity_type>.+)_(?P<property>[^_]+)_"(?P<value>.*)"#$"##).unwrap()
});

/// What to do with rows that carry no secondary index marker column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdRemapPolicy {
    /// Remap the id through the marker when one is present. Rows without a
    /// marker keep their legacy row key as the document id and gain no
    /// migration metadata. Suits tables that may already hold migrated
    /// documents.
    #[default]
    WhenMarkerPresent,

    /// Every row must carry a marker; a row without one aborts the export.
    /// Suits untouched legacy tables, where an absent marker means the row
    /// is not saga data at all.
    RequireMarker,
}

/// The three parts of a secondary index marker.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MarkerIdentity {
    entity_type: String,
    property: String,
    value: String,
}

fn parse_index_marker(marker: &str) -> Option<MarkerIdentity> {
    let captures = INDEX_MARKER.captures(marker)?;
    Some(MarkerIdentity {
        entity_type: captures["entity_type"].to_string(),
        property: captures["property"].to_string(),
        value: captures["value"].to_string(),
    })
}

/// One row rendered into the document store shape, ready to write.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedDocument {
    /// Document id, which is also the output file stem.
    pub id: String,
    /// The full document: metadata first, then the id, then the projected
    /// columns.
    pub document: Value,
}

/// Turns data rows into saga documents.
#[derive(Debug, Clone)]
pub struct RowTransformer {
    policy: IdRemapPolicy,
    projector: ValueProjector,
}

impl RowTransformer {
    pub fn new(policy: IdRemapPolicy, projector: ValueProjector) -> Self {
        Self { policy, projector }
    }

    /// Transforms one data row into a document.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::MalformedIndexMarker`] when the marker
    /// column exists but does not parse, and
    /// [`TransformError::MissingIndexMarker`] when the row has no marker
    /// under [`IdRemapPolicy::RequireMarker`]. Both abort the export run.
    pub fn transform(&self, row: &TableRow) -> Result<TransformedDocument, TransformError> {
        let (id, metadata) = self.identity_for(row)?;

        let mut document = Map::with_capacity(row.cells.len() + 2);
        document.insert(METADATA_KEY.to_string(), metadata_value(&metadata));
        document.insert(DOCUMENT_ID_KEY.to_string(), Value::String(id.clone()));
        for (column, cell) in &row.cells {
            if matches!(
                column.as_str(),
                PARTITION_KEY_COLUMN | ROW_KEY_COLUMN | SECONDARY_INDEX_COLUMN
            ) {
                continue;
            }
            document.insert(column.clone(), self.projector.project(cell));
        }

        Ok(TransformedDocument {
            id,
            document: Value::Object(document),
        })
    }

    fn identity_for(&self, row: &TableRow) -> Result<(String, SagaMetadata), TransformError> {
        match row.cell(SECONDARY_INDEX_COLUMN) {
            Some(CellValue::String(marker)) => {
                let identity = parse_index_marker(marker).ok_or_else(|| {
                    TransformError::MalformedIndexMarker {
                        row_key: row.row_key.clone(),
                        marker: marker.clone(),
                    }
                })?;
                let saga_id = SagaIdGenerator::generate(
                    &identity.entity_type,
                    &identity.property,
                    &identity.value,
                );
                debug!(
                    row_key = %row.row_key,
                    entity_type = %identity.entity_type,
                    new_id = %saga_id,
                    "remapped row id from secondary index marker"
                );
                let metadata = SagaMetadata::migrated(identity.entity_type, row.row_key.clone());
                Ok((saga_id.to_string(), metadata))
            }
            Some(other) => Err(TransformError::MalformedIndexMarker {
                row_key: row.row_key.clone(),
                marker: format!("non-string {} cell", other.kind()),
            }),
            None => match self.policy {
                IdRemapPolicy::RequireMarker => Err(TransformError::MissingIndexMarker {
                    row_key: row.row_key.clone(),
                }),
                IdRemapPolicy::WhenMarkerPresent => {
                    Ok((row.row_key.clone(), SagaMetadata::current()))
                }
            },
        }
    }
}

// SagaMetadata serializes infallibly, and spelling the keys out keeps the
// transform free of serialization error plumbing.
fn metadata_value(metadata: &SagaMetadata) -> Value {
    let mut map = Map::with_capacity(3);
    map.insert(
        SCHEMA_VERSION_KEY.to_string(),
        Value::String(metadata.schema_version.clone()),
    );
    if let Some(full_type_name) = &metadata.full_type_name {
        map.insert(
            FULL_TYPE_NAME_KEY.to_string(),
            Value::String(full_type_name.clone()),
        );
    }
    if let Some(migrated_saga_id) = &metadata.migrated_saga_id {
        map.insert(
            MIGRATED_SAGA_ID_KEY.to_string(),
            Value::String(migrated_saga_id.clone()),
        );
    }
    Value::Object(map)
}
