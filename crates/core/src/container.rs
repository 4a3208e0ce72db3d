//! DocumentContainer port trait definition.
//!
//! This module defines the [`DocumentContainer`] trait that storage backends
//! must implement to provide document storage for the saga persister. The
//! trait deliberately exposes only two primitives: a point read and an atomic
//! multi-operation batch scoped to a single logical partition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Logical partition key under which a group of documents lives.
///
/// All documents touched by one unit of work must share a partition key,
/// because the backing store only guarantees batch atomicity within a
/// single partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey(String);

impl PartitionKey {
    /// Create a partition key from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw key value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PartitionKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PartitionKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<uuid::Uuid> for PartitionKey {
    fn from(value: uuid::Uuid) -> Self {
        Self(value.to_string())
    }
}

/// Opaque version tag returned by the store for every stored document.
///
/// The tag changes on every write. Conditional operations carry the tag the
/// caller last observed; the store rejects the operation when the stored tag
/// no longer matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionTag(String);

impl VersionTag {
    /// Create a version tag from the backend representation.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw tag value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome classification for a single store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    /// The operation succeeded against an existing document.
    Ok,
    /// The operation created a new document.
    Created,
    /// The target document does not exist.
    NotFound,
    /// A document with the same id already exists.
    Conflict,
    /// A conditional operation found a different version tag than supplied.
    PreconditionFailed,
    /// Any other backend status, carried through for diagnostics.
    Other(u16),
}

impl OperationStatus {
    /// Whether the operation took effect.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::Created)
    }

    /// Whether the status signals that a concurrent writer got there first.
    ///
    /// `NotFound` counts: a conditional replace or delete against a document
    /// another writer already removed lost the race just the same.
    pub fn is_concurrency_signal(self) -> bool {
        matches!(self, Self::Conflict | Self::PreconditionFailed | Self::NotFound)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Created => write!(f, "created"),
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::PreconditionFailed => write!(f, "precondition_failed"),
            Self::Other(code) => write!(f, "status({})", code),
        }
    }
}

/// A single write inside an atomic batch.
#[derive(Debug, Clone)]
pub enum BatchOperation {
    /// Create a new document; fails with [`OperationStatus::Conflict`] if the
    /// id is already taken.
    Create {
        /// Document id, unique within the partition.
        id: String,
        /// Full document body.
        document: Value,
    },
    /// Replace an existing document.
    Replace {
        /// Document id.
        id: String,
        /// Full replacement body.
        document: Value,
        /// When set, the replace only succeeds if the stored tag matches.
        if_version: Option<VersionTag>,
    },
    /// Create the document or replace whatever is stored under the id.
    Upsert {
        /// Document id.
        id: String,
        /// Full document body.
        document: Value,
    },
    /// Delete a document.
    Delete {
        /// Document id.
        id: String,
        /// When set, the delete only succeeds if the stored tag matches.
        if_version: Option<VersionTag>,
    },
}

impl BatchOperation {
    /// The id of the document this operation targets.
    pub fn document_id(&self) -> &str {
        match self {
            Self::Create { id, .. }
            | Self::Replace { id, .. }
            | Self::Upsert { id, .. }
            | Self::Delete { id, .. } => id,
        }
    }

    /// Short operation name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Replace { .. } => "replace",
            Self::Upsert { .. } => "upsert",
            Self::Delete { .. } => "delete",
        }
    }
}

/// Result of a point read.
#[derive(Debug, Clone)]
pub struct DocumentReadResult {
    /// Outcome of the read.
    pub status: OperationStatus,
    /// The document body, present on success.
    pub document: Option<Value>,
    /// The version tag observed, present on success.
    pub version: Option<VersionTag>,
}

impl DocumentReadResult {
    /// A successful read carrying a body and its version tag.
    pub fn found(document: Value, version: VersionTag) -> Self {
        Self {
            status: OperationStatus::Ok,
            document: Some(document),
            version: Some(version),
        }
    }

    /// A read that found nothing.
    pub fn not_found() -> Self {
        Self {
            status: OperationStatus::NotFound,
            document: None,
            version: None,
        }
    }
}

/// Result of one operation inside a batch, reported at the same position
/// as the operation that produced it.
#[derive(Debug, Clone)]
pub struct BatchItemResult {
    /// Outcome of the operation.
    pub status: OperationStatus,
    /// The stored document after the operation, when the backend returns it.
    pub document: Option<Value>,
    /// The version tag after the operation, present on success.
    pub version: Option<VersionTag>,
}

impl BatchItemResult {
    /// Whether the operation took effect.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Trait for transactional document storage.
///
/// The container is the only thing the saga persister knows about the
/// backing store. Implementations must provide:
/// - Point reads by id within a partition
/// - Atomic execution of a batch of writes within one partition
/// - Version tags on every stored document
///
/// # Atomicity Model
///
/// `execute_batch` is all-or-nothing: when any operation in the batch is
/// rejected, no operation in the batch takes effect. The returned results
/// are positional, so callers correlate result `i` with operation `i`. A
/// rejected batch is still an `Ok` return carrying per-item statuses;
/// `Err` is reserved for transport and backend failures.
#[async_trait]
pub trait DocumentContainer: Send + Sync {
    /// The error type for this implementation.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Read a single document by id.
    ///
    /// # Returns
    ///
    /// A [`DocumentReadResult`] with status [`OperationStatus::NotFound`]
    /// when the document does not exist. Backend failures map to `Err`.
    async fn read_by_id(
        &self,
        id: &str,
        partition_key: &PartitionKey,
    ) -> Result<DocumentReadResult, Self::Error>;

    /// Execute a batch of operations atomically within one partition.
    ///
    /// # Arguments
    ///
    /// * `partition_key` - The partition every operation applies to.
    /// * `operations` - The writes, in order.
    ///
    /// # Returns
    ///
    /// One [`BatchItemResult`] per operation, in the same order.
    async fn execute_batch(
        &self,
        partition_key: &PartitionKey,
        operations: Vec<BatchOperation>,
    ) -> Result<Vec<BatchItemResult>, Self::Error>;
}

/// Pull the single result out of a one-operation batch, guarding the
/// positional contract.
pub(crate) fn expect_single<E>(
    mut results: Vec<BatchItemResult>,
) -> Result<BatchItemResult, crate::error::PersistenceError<E>> {
    if results.len() != 1 {
        return Err(crate::error::PersistenceError::ShapeMismatch {
            submitted: 1,
            returned: results.len(),
        });
    }
    Ok(results.remove(0))
}
