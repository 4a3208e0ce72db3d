//! In-memory implementation of DocumentContainer for testing.

use async_trait::async_trait;
use parking_lot::RwLock;
use sagastore_core::{
    BatchItemResult, BatchOperation, DocumentContainer, DocumentReadResult, OperationStatus,
    PartitionKey, VersionTag,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// In-memory document container implementation.
///
/// Documents live in a partition-to-id map behind a single lock, and every
/// write mints a fresh version tag from a shared counter. `execute_batch`
/// holds the write lock for the whole batch and applies nothing unless
/// every operation passes its checks, which is the all-or-nothing contract
/// real container backends provide.
///
/// # Thread Safety
///
/// All methods take `&self` and internally use `parking_lot::RwLock` for
/// safe concurrent access. Clones share the same storage.
#[derive(Debug, Default, Clone)]
pub struct InMemoryDocumentContainer {
    inner: Arc<InnerStore>,
}

#[derive(Debug, Default)]
struct InnerStore {
    partitions: RwLock<HashMap<String, HashMap<String, StoredDocument>>>,
    version_counter: AtomicU64,
    outage: RwLock<Option<String>>,
}

#[derive(Debug, Clone)]
struct StoredDocument {
    document: Value,
    version: VersionTag,
}

/// A write that passed its checks and is waiting for the rest of the
/// batch to pass too.
enum StagedWrite {
    Put {
        id: String,
        document: Value,
        version: VersionTag,
    },
    Remove {
        id: String,
    },
}

impl InMemoryDocumentContainer {
    /// Create a new empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a container pre-loaded with documents.
    ///
    /// Each entry is `(partition key, document id, document body)`. Every
    /// seeded document gets a fresh version tag.
    pub fn with_documents(documents: Vec<(&str, &str, Value)>) -> Self {
        let container = Self::new();
        for (partition_key, id, document) in documents {
            container.seed(partition_key, id, document);
        }
        container
    }

    /// Insert a document directly, bypassing batch semantics.
    ///
    /// Returns the version tag assigned to the document.
    pub fn seed(&self, partition_key: &str, id: &str, document: Value) -> VersionTag {
        let version = self.next_version();
        let mut partitions = self.inner.partitions.write();
        partitions.entry(partition_key.to_string()).or_default().insert(
            id.to_string(),
            StoredDocument {
                document,
                version: version.clone(),
            },
        );
        version
    }

    /// Clear all data.
    pub fn clear(&self) {
        self.inner.partitions.write().clear();
    }

    /// Total number of stored documents across all partitions.
    pub fn document_count(&self) -> usize {
        self.inner.partitions.read().values().map(HashMap::len).sum()
    }

    /// The stored body of a document, if present.
    pub fn document(&self, partition_key: &str, id: &str) -> Option<Value> {
        self.inner
            .partitions
            .read()
            .get(partition_key)
            .and_then(|partition| partition.get(id))
            .map(|stored| stored.document.clone())
    }

    /// The current version tag of a document, if present.
    pub fn version_of(&self, partition_key: &str, id: &str) -> Option<VersionTag> {
        self.inner
            .partitions
            .read()
            .get(partition_key)
            .and_then(|partition| partition.get(id))
            .map(|stored| stored.version.clone())
    }

    /// Make every following operation fail with the given message, until
    /// [`heal`] is called.
    ///
    /// [`heal`]: InMemoryDocumentContainer::heal
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.inner.outage.write() = Some(message.into());
    }

    /// Clear a failure installed by [`fail_with`].
    ///
    /// [`fail_with`]: InMemoryDocumentContainer::fail_with
    pub fn heal(&self) {
        *self.inner.outage.write() = None;
    }

    fn next_version(&self) -> VersionTag {
        let count = self.inner.version_counter.fetch_add(1, Ordering::SeqCst) + 1;
        VersionTag::new(format!("v{}", count))
    }

    fn check_outage(&self) -> Result<(), InMemoryContainerError> {
        match self.inner.outage.read().as_ref() {
            Some(message) => Err(InMemoryContainerError::Outage(message.clone())),
            None => Ok(()),
        }
    }

    /// Check one operation against the current partition state and stage
    /// its write if it passes.
    fn plan(
        &self,
        partition: &HashMap<String, StoredDocument>,
        operation: &BatchOperation,
    ) -> (BatchItemResult, Option<StagedWrite>) {
        match operation {
            BatchOperation::Create { id, document } => {
                if partition.contains_key(id) {
                    (rejected(OperationStatus::Conflict), None)
                } else {
                    let version = self.next_version();
                    (
                        applied(OperationStatus::Created, document, &version),
                        Some(StagedWrite::put(id, document, version)),
                    )
                }
            }
            BatchOperation::Replace {
                id,
                document,
                if_version,
            } => match partition.get(id) {
                None => (rejected(OperationStatus::NotFound), None),
                Some(stored) if version_mismatch(if_version, &stored.version) => {
                    (rejected(OperationStatus::PreconditionFailed), None)
                }
                Some(_) => {
                    let version = self.next_version();
                    (
                        applied(OperationStatus::Ok, document, &version),
                        Some(StagedWrite::put(id, document, version)),
                    )
                }
            },
            BatchOperation::Upsert { id, document } => {
                let status = if partition.contains_key(id) {
                    OperationStatus::Ok
                } else {
                    OperationStatus::Created
                };
                let version = self.next_version();
                (
                    applied(status, document, &version),
                    Some(StagedWrite::put(id, document, version)),
                )
            }
            BatchOperation::Delete { id, if_version } => match partition.get(id) {
                None => (rejected(OperationStatus::NotFound), None),
                Some(stored) if version_mismatch(if_version, &stored.version) => {
                    (rejected(OperationStatus::PreconditionFailed), None)
                }
                Some(_) => (
                    BatchItemResult {
                        status: OperationStatus::Ok,
                        document: None,
                        version: None,
                    },
                    Some(StagedWrite::Remove { id: id.clone() }),
                ),
            },
        }
    }
}

impl StagedWrite {
    fn put(id: &str, document: &Value, version: VersionTag) -> Self {
        Self::Put {
            id: id.to_string(),
            document: document.clone(),
            version,
        }
    }
}

fn version_mismatch(expected: &Option<VersionTag>, stored: &VersionTag) -> bool {
    matches!(expected, Some(tag) if tag != stored)
}

fn rejected(status: OperationStatus) -> BatchItemResult {
    BatchItemResult {
        status,
        document: None,
        version: None,
    }
}

fn applied(status: OperationStatus, document: &Value, version: &VersionTag) -> BatchItemResult {
    BatchItemResult {
        status,
        document: Some(document.clone()),
        version: Some(version.clone()),
    }
}

#[async_trait]
impl DocumentContainer for InMemoryDocumentContainer {
    type Error = InMemoryContainerError;

    async fn read_by_id(
        &self,
        id: &str,
        partition_key: &PartitionKey,
    ) -> Result<DocumentReadResult, Self::Error> {
        self.check_outage()?;
        let partitions = self.inner.partitions.read();
        match partitions
            .get(partition_key.as_str())
            .and_then(|partition| partition.get(id))
        {
            Some(stored) => Ok(DocumentReadResult::found(
                stored.document.clone(),
                stored.version.clone(),
            )),
            None => Ok(DocumentReadResult::not_found()),
        }
    }

    async fn execute_batch(
        &self,
        partition_key: &PartitionKey,
        operations: Vec<BatchOperation>,
    ) -> Result<Vec<BatchItemResult>, Self::Error> {
        self.check_outage()?;
        // One write guard for the whole batch keeps it atomic against
        // concurrent callers.
        let mut partitions = self.inner.partitions.write();
        let partition = partitions
            .entry(partition_key.as_str().to_string())
            .or_default();

        let mut results = Vec::with_capacity(operations.len());
        let mut staged = Vec::with_capacity(operations.len());
        let mut any_rejected = false;

        for operation in &operations {
            let (result, write) = self.plan(partition, operation);
            any_rejected |= !result.is_success();
            results.push(result);
            if let Some(write) = write {
                staged.push(write);
            }
        }

        if !any_rejected {
            for write in staged {
                match write {
                    StagedWrite::Put {
                        id,
                        document,
                        version,
                    } => {
                        partition.insert(id, StoredDocument { document, version });
                    }
                    StagedWrite::Remove { id } => {
                        partition.remove(&id);
                    }
                }
            }
        }

        Ok(results)
    }
}

/// Error type for InMemoryDocumentContainer operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InMemoryContainerError {
    #[error("Simulated outage: {0}")]
    Outage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<String> for InMemoryContainerError {
    fn from(s: String) -> Self {
        Self::Internal(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::Barrier;

    fn partition() -> PartitionKey {
        PartitionKey::new("Samples.OrderSagaData")
    }

    #[tokio::test]
    async fn test_read_of_missing_document_is_not_found() {
        let container = InMemoryDocumentContainer::new();

        let read = container.read_by_id("missing", &partition()).await.unwrap();

        assert_eq!(read.status, OperationStatus::NotFound);
        assert!(read.document.is_none());
        assert!(read.version.is_none());
    }

    #[tokio::test]
    async fn test_create_then_read_round_trips() {
        let container = InMemoryDocumentContainer::new();

        let results = container
            .execute_batch(
                &partition(),
                vec![BatchOperation::Create {
                    id: "doc-1".to_string(),
                    document: json!({"OrderId": "order-7"}),
                }],
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, OperationStatus::Created);
        let version = results[0].version.clone().unwrap();

        let read = container.read_by_id("doc-1", &partition()).await.unwrap();
        assert_eq!(read.status, OperationStatus::Ok);
        assert_eq!(read.document, Some(json!({"OrderId": "order-7"})));
        assert_eq!(read.version, Some(version));
    }

    #[tokio::test]
    async fn test_create_conflicts_on_existing_id() {
        let container = InMemoryDocumentContainer::new();
        container.seed("Samples.OrderSagaData", "doc-1", json!({"v": 1}));

        let results = container
            .execute_batch(
                &partition(),
                vec![BatchOperation::Create {
                    id: "doc-1".to_string(),
                    document: json!({"v": 2}),
                }],
            )
            .await
            .unwrap();

        assert_eq!(results[0].status, OperationStatus::Conflict);
        assert_eq!(
            container.document("Samples.OrderSagaData", "doc-1"),
            Some(json!({"v": 1}))
        );
    }

    #[tokio::test]
    async fn test_replace_honors_the_version_condition() {
        let container = InMemoryDocumentContainer::new();
        let version = container.seed("Samples.OrderSagaData", "doc-1", json!({"v": 1}));

        let results = container
            .execute_batch(
                &partition(),
                vec![BatchOperation::Replace {
                    id: "doc-1".to_string(),
                    document: json!({"v": 2}),
                    if_version: Some(version.clone()),
                }],
            )
            .await
            .unwrap();
        assert_eq!(results[0].status, OperationStatus::Ok);
        assert_ne!(results[0].version, Some(version.clone()));

        // The first replace bumped the tag, so the same condition now fails.
        let results = container
            .execute_batch(
                &partition(),
                vec![BatchOperation::Replace {
                    id: "doc-1".to_string(),
                    document: json!({"v": 3}),
                    if_version: Some(version),
                }],
            )
            .await
            .unwrap();
        assert_eq!(results[0].status, OperationStatus::PreconditionFailed);
        assert_eq!(
            container.document("Samples.OrderSagaData", "doc-1"),
            Some(json!({"v": 2}))
        );
    }

    #[tokio::test]
    async fn test_unconditional_replace_skips_the_version_check() {
        let container = InMemoryDocumentContainer::new();
        container.seed("Samples.OrderSagaData", "doc-1", json!({"v": 1}));

        let results = container
            .execute_batch(
                &partition(),
                vec![BatchOperation::Replace {
                    id: "doc-1".to_string(),
                    document: json!({"v": 2}),
                    if_version: None,
                }],
            )
            .await
            .unwrap();

        assert_eq!(results[0].status, OperationStatus::Ok);
    }

    #[tokio::test]
    async fn test_replace_of_missing_document_is_not_found() {
        let container = InMemoryDocumentContainer::new();

        let results = container
            .execute_batch(
                &partition(),
                vec![BatchOperation::Replace {
                    id: "missing".to_string(),
                    document: json!({}),
                    if_version: None,
                }],
            )
            .await
            .unwrap();

        assert_eq!(results[0].status, OperationStatus::NotFound);
    }

    #[tokio::test]
    async fn test_upsert_creates_then_replaces() {
        let container = InMemoryDocumentContainer::new();

        let results = container
            .execute_batch(
                &partition(),
                vec![BatchOperation::Upsert {
                    id: "doc-1".to_string(),
                    document: json!({"v": 1}),
                }],
            )
            .await
            .unwrap();
        assert_eq!(results[0].status, OperationStatus::Created);

        let results = container
            .execute_batch(
                &partition(),
                vec![BatchOperation::Upsert {
                    id: "doc-1".to_string(),
                    document: json!({"v": 2}),
                }],
            )
            .await
            .unwrap();
        assert_eq!(results[0].status, OperationStatus::Ok);
        assert_eq!(
            container.document("Samples.OrderSagaData", "doc-1"),
            Some(json!({"v": 2}))
        );
    }

    #[tokio::test]
    async fn test_delete_with_stale_version_is_rejected() {
        let container = InMemoryDocumentContainer::new();
        container.seed("Samples.OrderSagaData", "doc-1", json!({"v": 1}));
        let stale = VersionTag::new("v999");

        let results = container
            .execute_batch(
                &partition(),
                vec![BatchOperation::Delete {
                    id: "doc-1".to_string(),
                    if_version: Some(stale),
                }],
            )
            .await
            .unwrap();

        assert_eq!(results[0].status, OperationStatus::PreconditionFailed);
        assert_eq!(container.document_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_batch_applies_nothing() {
        let container = InMemoryDocumentContainer::new();

        // The create on its own would succeed, but the batch also carries a
        // replace of a document that does not exist.
        let results = container
            .execute_batch(
                &partition(),
                vec![
                    BatchOperation::Create {
                        id: "doc-1".to_string(),
                        document: json!({"v": 1}),
                    },
                    BatchOperation::Replace {
                        id: "missing".to_string(),
                        document: json!({}),
                        if_version: None,
                    },
                ],
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, OperationStatus::Created);
        assert_eq!(results[1].status, OperationStatus::NotFound);
        assert_eq!(container.document_count(), 0);

        let read = container.read_by_id("doc-1", &partition()).await.unwrap();
        assert_eq!(read.status, OperationStatus::NotFound);
    }

    #[tokio::test]
    async fn test_partitions_are_isolated() {
        let container = InMemoryDocumentContainer::new();
        container.seed("partition-a", "doc-1", json!({"v": 1}));

        let read = container
            .read_by_id("doc-1", &PartitionKey::new("partition-b"))
            .await
            .unwrap();

        assert_eq!(read.status, OperationStatus::NotFound);
    }

    #[tokio::test]
    async fn test_outage_surfaces_as_an_error() {
        let container = InMemoryDocumentContainer::new();
        container.fail_with("storage offline");

        let err = container
            .read_by_id("doc-1", &partition())
            .await
            .unwrap_err();
        assert_eq!(err, InMemoryContainerError::Outage("storage offline".to_string()));

        container.heal();
        assert!(container.read_by_id("doc-1", &partition()).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_creates_elect_one_winner() {
        let container = InMemoryDocumentContainer::new();
        let barrier = Arc::new(Barrier::new(10));

        let mut handles = Vec::new();
        for writer in 0..10 {
            let container = container.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                let results = container
                    .execute_batch(
                        &PartitionKey::new("Samples.OrderSagaData"),
                        vec![BatchOperation::Create {
                            id: "contested".to_string(),
                            document: json!({"writer": writer}),
                        }],
                    )
                    .await
                    .unwrap();
                results[0].status
            }));
        }

        let mut created = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                OperationStatus::Created => created += 1,
                OperationStatus::Conflict => conflicts += 1,
                other => panic!("unexpected status {other}"),
            }
        }

        assert_eq!(created, 1);
        assert_eq!(conflicts, 9);
        assert_eq!(container.document_count(), 1);
    }

    #[tokio::test]
    async fn test_clear_store() {
        let container = InMemoryDocumentContainer::new();
        container.seed("Samples.OrderSagaData", "doc-1", json!({}));
        container.seed("Samples.ShippingSagaData", "doc-2", json!({}));

        assert_eq!(container.document_count(), 2);

        container.clear();

        assert_eq!(container.document_count(), 0);
    }
}
