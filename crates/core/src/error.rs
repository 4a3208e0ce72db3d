//! Error types shared by the persistence surface.
//!
//! Every fallible operation in this crate returns [`PersistenceError`],
//! generic over the backend error of the [`DocumentContainer`] in use so
//! that transport failures keep their original type.
//!
//! [`DocumentContainer`]: crate::container::DocumentContainer

use crate::container::OperationStatus;
use crate::saga::lock::LeaseState;
use uuid::Uuid;

/// Errors that can occur when persisting sagas, outbox records or
/// subscriptions.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError<E> {
    /// A concurrent writer changed or removed a document this unit of work
    /// depended on. The losing side observes this instead of overwriting.
    #[error("Concurrency conflict: document {document_id} was modified or removed by another writer")]
    Conflict {
        /// Id of the contested document. For saga state this is the saga id.
        document_id: String,
    },

    /// The pessimistic lease lock could not be acquired in time.
    #[error("Lock acquisition for saga {saga_id} timed out after {waited_ms} ms")]
    LockTimeout {
        /// The saga whose lock was contested.
        saga_id: Uuid,
        /// How long this caller waited before giving up.
        waited_ms: u64,
    },

    /// A held lease was taken over by another holder before it could be
    /// refreshed.
    #[error("Lease for saga {saga_id} was taken over by another holder")]
    LeaseLost {
        /// The saga whose lease was lost.
        saga_id: Uuid,
    },

    /// A lease operation was attempted in a state that does not allow it.
    #[error("Lease for saga {saga_id} is {state}, not held")]
    LeaseNotHeld {
        /// The saga whose lease was misused.
        saga_id: Uuid,
        /// The state the lease was actually in.
        state: LeaseState,
    },

    /// An update or completion was issued for a saga this unit of work
    /// never read, so no version tag is available to condition the write.
    #[error("Saga {saga_id} was not read in this unit of work; nothing to condition the write on")]
    NotReadInSession {
        /// The saga the caller tried to write.
        saga_id: Uuid,
    },

    /// The store reported a status the persister has no handling for.
    #[error("Unexpected status {status} from {operation} on document {document_id}")]
    UnexpectedStatus {
        /// The operation that produced the status.
        operation: &'static str,
        /// The document the operation targeted.
        document_id: String,
        /// The status the store reported.
        status: OperationStatus,
    },

    /// The store reported success but returned no version tag, so later
    /// conditional writes would have nothing to stand on.
    #[error("Store returned no version tag for document {document_id}")]
    MissingVersionTag {
        /// The document the operation targeted.
        document_id: String,
    },

    /// The store returned a different number of results than operations
    /// submitted, so results cannot be correlated positionally.
    #[error("Batch shape mismatch: submitted {submitted} operations, store returned {returned} results")]
    ShapeMismatch {
        /// Operations submitted in the batch.
        submitted: usize,
        /// Results the store returned.
        returned: usize,
    },

    /// A document could not be wrapped into or unwrapped from its stored
    /// envelope.
    #[error("Envelope error: {0}")]
    Envelope(String),

    /// Backend-specific error.
    #[error("Backend error: {0}")]
    Backend(E),
}

impl<E> PersistenceError<E> {
    /// Create a concurrency conflict error.
    pub fn conflict(document_id: impl Into<String>) -> Self {
        Self::Conflict {
            document_id: document_id.into(),
        }
    }

    /// Create an unexpected status error.
    pub fn unexpected_status(
        operation: &'static str,
        document_id: impl Into<String>,
        status: OperationStatus,
    ) -> Self {
        Self::UnexpectedStatus {
            operation,
            document_id: document_id.into(),
            status,
        }
    }

    /// Create an envelope error from any displayable cause.
    pub fn envelope(cause: impl std::fmt::Display) -> Self {
        Self::Envelope(cause.to_string())
    }

    /// Check if this is a concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Check if this is a lock acquisition timeout.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

impl<E> From<E> for PersistenceError<E> {
    fn from(err: E) -> Self {
        PersistenceError::Backend(err)
    }
}
