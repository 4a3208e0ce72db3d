//! Stored document shape for saga state.
//!
//! A saga document is the business state serialized as a JSON object,
//! wrapped with two bookkeeping keys: a metadata subdocument under
//! [`METADATA_KEY`] and the document id under [`DOCUMENT_ID_KEY`]. The
//! business `Id` property is not stored twice; it folds into the document
//! id on the way in and is restored on the way out.
//!
//! Key names and their order are part of the storage format shared with
//! other runtimes reading the same containers. Do not touch them.

use crate::saga::SagaData;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Key of the metadata subdocument inside every stored document.
pub const METADATA_KEY: &str = "_NServiceBus-Persistence-Metadata";

/// Metadata key recording the saga storage schema version.
pub const SCHEMA_VERSION_KEY: &str = "SagaDataContainer-SchemaVersion";

/// Metadata key recording the full type name, written for migrated sagas.
pub const FULL_TYPE_NAME_KEY: &str = "SagaDataContainer-FullTypeName";

/// Metadata key recording the legacy id a migrated saga had before import.
pub const MIGRATED_SAGA_ID_KEY: &str = "SagaDataContainer-MigratedSagaId";

/// Current saga storage schema version.
pub const SAGA_SCHEMA_VERSION: &str = "1.0.0";

/// Document key holding the saga id.
pub const DOCUMENT_ID_KEY: &str = "id";

/// Conventional name of the identity property on business saga state.
pub const BUSINESS_ID_PROPERTY: &str = "Id";

/// Bookkeeping carried alongside every saga document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaMetadata {
    /// Storage schema version the document was written with.
    #[serde(rename = "SagaDataContainer-SchemaVersion")]
    pub schema_version: String,

    /// Full type name of the saga data, recorded by the migration path.
    #[serde(
        rename = "SagaDataContainer-FullTypeName",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub full_type_name: Option<String>,

    /// Id the saga had in the legacy store it was migrated from.
    #[serde(
        rename = "SagaDataContainer-MigratedSagaId",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub migrated_saga_id: Option<String>,
}

impl SagaMetadata {
    /// Metadata for a document written by this persister.
    pub fn current() -> Self {
        Self {
            schema_version: SAGA_SCHEMA_VERSION.to_string(),
            full_type_name: None,
            migrated_saga_id: None,
        }
    }

    /// Metadata for a document imported from a legacy store.
    pub fn migrated(full_type_name: impl Into<String>, legacy_id: impl Into<String>) -> Self {
        Self {
            schema_version: SAGA_SCHEMA_VERSION.to_string(),
            full_type_name: Some(full_type_name.into()),
            migrated_saga_id: Some(legacy_id.into()),
        }
    }

    /// Whether this document was imported from a legacy store.
    pub fn is_migrated(&self) -> bool {
        self.migrated_saga_id.is_some()
    }
}

impl Default for SagaMetadata {
    fn default() -> Self {
        Self::current()
    }
}

/// A saga document pulled apart into its three layers.
#[derive(Debug, Clone)]
pub struct SagaRecord<T> {
    /// Deterministic id the document is stored under.
    pub saga_id: Uuid,
    /// Bookkeeping read from the document.
    pub metadata: SagaMetadata,
    /// The business state.
    pub data: T,
}

/// Errors that can occur while wrapping or unwrapping saga documents.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// Saga state must serialize to a JSON object.
    #[error("saga data must serialize to a JSON object, got {actual}")]
    NotAnObject {
        /// What the value serialized to instead.
        actual: &'static str,
    },

    /// The business state uses a document key reserved by the envelope.
    #[error("saga data property {name:?} collides with a reserved document key")]
    ReservedProperty {
        /// The colliding property name.
        name: &'static str,
    },

    /// A required envelope key is absent from the document.
    #[error("stored document is missing the {key:?} key")]
    MissingKey {
        /// The missing key.
        key: &'static str,
    },

    /// The document id is not a saga id.
    #[error("stored document id {value:?} is not a valid saga id")]
    InvalidId {
        /// The raw id value found in the document.
        value: String,
    },

    /// Serialization failed.
    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Wrap business state into the stored document shape.
///
/// The business `Id` property is dropped from the body; the saga id goes
/// in under [`DOCUMENT_ID_KEY`] instead. Metadata comes first, then the
/// id, then the business properties in their serialized order.
pub fn wrap<T: SagaData>(
    saga_id: Uuid,
    data: &T,
    metadata: &SagaMetadata,
) -> Result<Value, EnvelopeError> {
    let body = serde_json::to_value(data)?;
    let mut body = match body {
        Value::Object(map) => map,
        other => {
            return Err(EnvelopeError::NotAnObject {
                actual: json_kind(&other),
            })
        }
    };
    body.remove(BUSINESS_ID_PROPERTY);
    if body.contains_key(METADATA_KEY) {
        return Err(EnvelopeError::ReservedProperty { name: METADATA_KEY });
    }
    if body.contains_key(DOCUMENT_ID_KEY) {
        return Err(EnvelopeError::ReservedProperty {
            name: DOCUMENT_ID_KEY,
        });
    }

    let mut document = Map::with_capacity(body.len() + 2);
    document.insert(METADATA_KEY.to_string(), serde_json::to_value(metadata)?);
    document.insert(
        DOCUMENT_ID_KEY.to_string(),
        Value::String(saga_id.to_string()),
    );
    for (key, value) in body {
        document.insert(key, value);
    }
    Ok(Value::Object(document))
}

/// Unwrap a stored document back into id, metadata and business state.
///
/// The document id is folded back into the business `Id` property before
/// deserializing, so state types that carry their identity get it restored
/// and types that do not simply ignore the extra property.
pub fn unwrap<T: SagaData>(document: &Value) -> Result<SagaRecord<T>, EnvelopeError> {
    let object = document.as_object().ok_or(EnvelopeError::NotAnObject {
        actual: json_kind(document),
    })?;

    let id_value = object.get(DOCUMENT_ID_KEY).ok_or(EnvelopeError::MissingKey {
        key: DOCUMENT_ID_KEY,
    })?;
    let id_str = id_value.as_str().ok_or_else(|| EnvelopeError::InvalidId {
        value: id_value.to_string(),
    })?;
    let saga_id = Uuid::parse_str(id_str).map_err(|_| EnvelopeError::InvalidId {
        value: id_str.to_string(),
    })?;

    let metadata_value = object
        .get(METADATA_KEY)
        .ok_or(EnvelopeError::MissingKey { key: METADATA_KEY })?;
    let metadata: SagaMetadata = serde_json::from_value(metadata_value.clone())?;

    let mut body = Map::with_capacity(object.len());
    for (key, value) in object {
        if key != DOCUMENT_ID_KEY && key != METADATA_KEY {
            body.insert(key.clone(), value.clone());
        }
    }
    body.insert(BUSINESS_ID_PROPERTY.to_string(), id_value.clone());
    let data: T = serde_json::from_value(Value::Object(body))?;

    Ok(SagaRecord {
        saga_id,
        metadata,
        data,
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
