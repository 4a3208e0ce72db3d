//! Unit of work over a single partition.
//!
//! A [`StorageSession`] collects every write a message handler produces,
//! saga state and outbox records alike, and hands them to the persister
//! for one atomic batch at commit time. Nothing touches the store until
//! then; reads go through the persister directly but record what they
//! observed here so later writes can be conditioned on it.

use crate::container::{BatchOperation, OperationStatus, PartitionKey, VersionTag};
use crate::error::PersistenceError;
use crate::saga::lock::SagaLease;
use std::collections::HashMap;
use tracing::error;
use uuid::Uuid;

/// What to raise when a batch operation comes back non-successful.
///
/// Handlers are registered per operation when the operation is queued, so
/// a failed result can be translated without guessing which document it
/// belonged to.
#[derive(Debug, Clone)]
pub enum ConflictHandler {
    /// No translation: any non-success surfaces as an unexpected status.
    Default,
    /// Concurrency-signal statuses surface as a typed conflict naming the
    /// contested document. Anything else still surfaces as unexpected.
    Concurrency {
        /// Document whose version the operation was conditioned on.
        document_id: String,
    },
}

impl ConflictHandler {
    /// Translate a non-success status into the error to raise.
    pub(crate) fn raise<E>(
        &self,
        operation: &BatchOperation,
        status: OperationStatus,
    ) -> PersistenceError<E> {
        match self {
            ConflictHandler::Concurrency { document_id } if status.is_concurrency_signal() => {
                PersistenceError::conflict(document_id.clone())
            }
            _ => PersistenceError::unexpected_status(
                operation.kind(),
                operation.document_id(),
                status,
            ),
        }
    }
}

/// One queued write and the handler that interprets its result.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    /// The write to execute.
    pub operation: BatchOperation,
    /// How to interpret a non-success result for this write.
    pub on_conflict: ConflictHandler,
}

/// Collects reads and writes for one unit of work.
///
/// The session is bound to a single partition key. All queued operations
/// execute in one atomic batch when the persister commits the session,
/// so a handler's saga update and its outbox record are applied together
/// or not at all.
#[derive(Debug)]
pub struct StorageSession {
    partition_key: PartitionKey,
    pending: Vec<PendingOperation>,
    versions: HashMap<String, VersionTag>,
    leases: Vec<SagaLease>,
}

impl StorageSession {
    /// Open a session over one partition.
    pub fn new(partition_key: impl Into<PartitionKey>) -> Self {
        Self {
            partition_key: partition_key.into(),
            pending: Vec::new(),
            versions: HashMap::new(),
            leases: Vec::new(),
        }
    }

    /// The partition this unit of work is bound to.
    pub fn partition_key(&self) -> &PartitionKey {
        &self.partition_key
    }

    /// Queue a write for the commit batch.
    ///
    /// Operations execute in the order they were queued. Hosts may queue
    /// their own document writes next to the saga and outbox operations;
    /// they share the batch and its atomicity.
    pub fn push(&mut self, operation: BatchOperation, on_conflict: ConflictHandler) {
        self.pending.push(PendingOperation {
            operation,
            on_conflict,
        });
    }

    /// Number of queued operations.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether anything is queued.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Remember the version tag a read observed for a document.
    pub(crate) fn record_version(&mut self, document_id: impl Into<String>, version: VersionTag) {
        self.versions.insert(document_id.into(), version);
    }

    /// The version tag last observed for a document in this session.
    pub(crate) fn version_of(&self, document_id: &str) -> Option<VersionTag> {
        self.versions.get(document_id).cloned()
    }

    /// Track a lease acquired on behalf of this session.
    pub(crate) fn track_lease(&mut self, lease: SagaLease) {
        self.leases.push(lease);
    }

    /// Whether this session already holds the lease for a saga.
    ///
    /// Reading the same saga twice in one unit of work must not contend
    /// with its own lease.
    pub(crate) fn holds_lease_for(&self, saga_id: Uuid) -> bool {
        self.leases.iter().any(|lease| lease.saga_id() == saga_id)
    }

    /// Hand out the queued operations for execution.
    pub(crate) fn take_pending(&mut self) -> Vec<PendingOperation> {
        std::mem::take(&mut self.pending)
    }

    /// Hand out the tracked leases for release.
    pub(crate) fn take_leases(&mut self) -> Vec<SagaLease> {
        std::mem::take(&mut self.leases)
    }
}

impl Drop for StorageSession {
    fn drop(&mut self) {
        // A session must end through commit or rollback so its leases get
        // released. A leaked lease blocks other writers until it expires.
        if !self.leases.is_empty() {
            error!(
                partition_key = %self.partition_key,
                leases = self.leases.len(),
                "storage session dropped while holding leases; \
                 they will block other writers until they expire"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct FakeBackendError;

    fn create_op(id: &str) -> BatchOperation {
        BatchOperation::Create {
            id: id.to_string(),
            document: json!({"id": id}),
        }
    }

    #[test]
    fn push_preserves_order_and_pairing() {
        let mut session = StorageSession::new("orders");
        session.push(create_op("a"), ConflictHandler::Default);
        session.push(
            create_op("b"),
            ConflictHandler::Concurrency {
                document_id: "b".to_string(),
            },
        );

        assert_eq!(session.pending_count(), 2);
        let pending = session.take_pending();
        assert_eq!(pending[0].operation.document_id(), "a");
        assert!(matches!(pending[0].on_conflict, ConflictHandler::Default));
        assert_eq!(pending[1].operation.document_id(), "b");
        assert!(matches!(
            pending[1].on_conflict,
            ConflictHandler::Concurrency { .. }
        ));
        assert!(session.is_empty());
    }

    #[test]
    fn versions_are_recorded_per_document() {
        let mut session = StorageSession::new("orders");
        session.record_version("doc-1", VersionTag::new("v1"));

        assert_eq!(session.version_of("doc-1"), Some(VersionTag::new("v1")));
        assert_eq!(session.version_of("doc-2"), None);
    }

    #[test]
    fn concurrency_handler_translates_conflict_signals() {
        let handler = ConflictHandler::Concurrency {
            document_id: "saga-1".to_string(),
        };
        let op = create_op("saga-1");

        let err: PersistenceError<FakeBackendError> =
            handler.raise(&op, OperationStatus::PreconditionFailed);
        assert!(err.is_conflict());

        let err: PersistenceError<FakeBackendError> =
            handler.raise(&op, OperationStatus::NotFound);
        assert!(err.is_conflict());
    }

    #[test]
    fn concurrency_handler_leaves_other_statuses_unexpected() {
        let handler = ConflictHandler::Concurrency {
            document_id: "saga-1".to_string(),
        };
        let op = create_op("saga-1");

        let err: PersistenceError<FakeBackendError> =
            handler.raise(&op, OperationStatus::Other(429));
        assert!(matches!(err, PersistenceError::UnexpectedStatus { .. }));
    }

    #[test]
    fn default_handler_never_translates() {
        let op = create_op("doc-1");
        let err: PersistenceError<FakeBackendError> =
            ConflictHandler::Default.raise(&op, OperationStatus::Conflict);
        assert!(matches!(err, PersistenceError::UnexpectedStatus { .. }));
        assert!(!err.is_conflict());
    }

    #[test]
    fn fresh_session_holds_no_leases() {
        let session = StorageSession::new("orders");
        assert!(!session.holds_lease_for(Uuid::new_v4()));
    }

    #[derive(Clone, Default)]
    struct CapturedLog(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLog {
        type Writer = CapturedLog;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    impl CapturedLog {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn held_lease(saga_id: Uuid) -> SagaLease {
        SagaLease::held(
            saga_id,
            format!("{saga_id}-lock"),
            PartitionKey::new("orders"),
            Uuid::new_v4(),
            VersionTag::new("v1"),
            chrono::Utc::now(),
        )
    }

    #[test]
    fn dropping_a_session_with_held_leases_logs_an_error() {
        let log = CapturedLog::default();
        // Only error-level events pass the filter, so the capture doubles
        // as a check on the severity.
        let subscriber = tracing_subscriber::fmt()
            .with_writer(log.clone())
            .with_max_level(tracing::Level::ERROR)
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let saga_id = Uuid::new_v4();
            let mut session = StorageSession::new("orders");
            session.track_lease(held_lease(saga_id));
            assert!(session.holds_lease_for(saga_id));
            drop(session);
        });

        assert!(log
            .contents()
            .contains("storage session dropped while holding leases"));
    }

    #[test]
    fn a_session_whose_leases_were_released_drops_silently() {
        let log = CapturedLog::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(log.clone())
            .with_max_level(tracing::Level::ERROR)
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let mut session = StorageSession::new("orders");
            session.track_lease(held_lease(Uuid::new_v4()));
            // Commit and rollback both drain the leases before the
            // session goes away.
            let _ = session.take_leases();
            drop(session);
        });

        assert!(log.contents().is_empty());
    }
}
