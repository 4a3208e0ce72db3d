//! # sagastore-core
//!
//! Saga, outbox and subscription persistence over transactional document
//! containers.
//!
//! ## Architecture
//!
//! This crate holds the persistence engine and its storage port. It knows
//! nothing about any concrete database; backends implement
//! [`DocumentContainer`] and everything else works on top of that trait:
//! point reads plus atomic per-partition batches are the only primitives.
//!
//! Saga state is guarded either optimistically, via version tags checked
//! at commit, or pessimistically, via lease documents that serialize
//! writers per saga. Either way a message handler's saga change and its
//! outbox record commit in one atomic batch.
//!
//! ## Modules
//!
//! - [`container`]: the [`DocumentContainer`] port and batch types
//! - [`session`]: the [`StorageSession`] unit of work
//! - [`saga`]: saga identity, envelope, persister and lease lock
//! - [`outbox`]: [`OutboxRecord`] storage for exactly-once processing
//! - [`subscriptions`]: [`SubscriptionStore`] for pub/sub routing
//! - [`config`]: concurrency mode and lock tuning
//! - [`error`]: [`PersistenceError`]
//!
//! ## Usage
//!
//! ```rust
//! use sagastore_core::SagaIdGenerator;
//!
//! // The saga id is a pure function of the correlation data, so any
//! // process can address the saga without a lookup index.
//! let a = SagaIdGenerator::generate("Samples.OrderSagaData", "OrderId", "order-9");
//! let b = SagaIdGenerator::generate("Samples.OrderSagaData", "OrderId", "order-9");
//! assert_eq!(a, b);
//! ```

pub mod config;
pub mod container;
pub mod error;
pub mod outbox;
pub mod saga;
pub mod session;
pub mod subscriptions;

pub use config::{ConcurrencyMode, ConfigurationError, EnvConfig, LockConfig, PersistenceConfig};
pub use container::{
    BatchItemResult, BatchOperation, DocumentContainer, DocumentReadResult, OperationStatus,
    PartitionKey, VersionTag,
};
pub use error::PersistenceError;
pub use outbox::{
    OutboxMetadata, OutboxPersister, OutboxRecord, TransportOperation, OUTBOX_SCHEMA_VERSION,
    OUTBOX_SCHEMA_VERSION_KEY,
};
pub use saga::envelope::{
    EnvelopeError, SagaMetadata, SagaRecord, BUSINESS_ID_PROPERTY, DOCUMENT_ID_KEY,
    FULL_TYPE_NAME_KEY, METADATA_KEY, MIGRATED_SAGA_ID_KEY, SAGA_SCHEMA_VERSION,
    SCHEMA_VERSION_KEY,
};
pub use saga::identity::SagaIdGenerator;
pub use saga::lock::{
    lease_document_id, LeaseLockManager, LeaseState, SagaLease, LEASE_EXPIRY_KEY,
    LEASE_HOLDER_KEY, LEASE_ID_SUFFIX,
};
pub use saga::persister::SagaPersister;
pub use saga::SagaData;
pub use session::{ConflictHandler, PendingOperation, StorageSession};
pub use subscriptions::{Subscriber, SubscriptionStore, SUBSCRIBERS_DOCUMENT_ID};
