//! Saga persister over a document container.
//!
//! The persister is the write path for saga state. Reads happen
//! immediately and record the observed version tag in the session; writes
//! are queued into the session and conditioned on those tags, so the
//! whole unit of work stands or falls in one atomic batch at commit.
//!
//! In pessimistic mode the first read of a saga also acquires its lease,
//! and every lease a session collected is released when the session ends,
//! on the success path and the failure path alike.

use crate::config::{ConfigurationError, PersistenceConfig};
use crate::container::{BatchOperation, DocumentContainer, OperationStatus, PartitionKey};
use crate::error::PersistenceError;
use crate::saga::envelope::{self, SagaMetadata, SagaRecord};
use crate::saga::identity::SagaIdGenerator;
use crate::saga::lock::LeaseLockManager;
use crate::saga::SagaData;
use crate::session::{ConflictHandler, StorageSession};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Reads and writes saga state through storage sessions.
pub struct SagaPersister<C: DocumentContainer> {
    container: Arc<C>,
    config: PersistenceConfig,
    lock: LeaseLockManager<C>,
}

impl<C: DocumentContainer> SagaPersister<C> {
    /// Create a persister over a container.
    ///
    /// Fails fast on invalid configuration instead of at the first
    /// message.
    pub fn new(container: Arc<C>, config: PersistenceConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let lock = LeaseLockManager::new(container.clone(), config.lock.clone())?;
        Ok(Self {
            container,
            config,
            lock,
        })
    }

    /// The configuration in effect.
    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    /// The lease lock manager, for hosts that refresh leases during
    /// long-running handlers.
    pub fn lock(&self) -> &LeaseLockManager<C> {
        &self.lock
    }

    /// Open a unit of work over one partition.
    pub fn open_session(&self, partition_key: impl Into<PartitionKey>) -> StorageSession {
        StorageSession::new(partition_key)
    }

    /// Load a saga by id.
    ///
    /// Returns `None` when no such saga exists. On success the observed
    /// version tag is recorded in the session, so a later [`update`] or
    /// [`complete`] in the same unit of work is conditioned on exactly
    /// this read.
    ///
    /// In pessimistic mode the saga's lease is acquired first, unless the
    /// session already holds it from an earlier read.
    ///
    /// [`update`]: SagaPersister::update
    /// [`complete`]: SagaPersister::complete
    pub async fn get<T: SagaData>(
        &self,
        saga_id: Uuid,
        session: &mut StorageSession,
    ) -> Result<Option<SagaRecord<T>>, PersistenceError<C::Error>> {
        if self.config.mode.is_pessimistic() && !session.holds_lease_for(saga_id) {
            let lease = self.lock.acquire(saga_id, session.partition_key()).await?;
            session.track_lease(lease);
        }

        let document_id = saga_id.to_string();
        let read = self
            .container
            .read_by_id(&document_id, session.partition_key())
            .await?;
        match read.status {
            OperationStatus::NotFound => Ok(None),
            status if status.is_success() => {
                let version = read
                    .version
                    .ok_or_else(|| PersistenceError::MissingVersionTag {
                        document_id: document_id.clone(),
                    })?;
                let document = read.document.ok_or_else(|| {
                    PersistenceError::envelope("store returned success without a document body")
                })?;
                session.record_version(&document_id, version);
                let record =
                    envelope::unwrap::<T>(&document).map_err(PersistenceError::envelope)?;
                debug!(
                    %saga_id,
                    migrated = record.metadata.is_migrated(),
                    "loaded saga state"
                );
                Ok(Some(record))
            }
            other => Err(PersistenceError::unexpected_status(
                "read",
                document_id,
                other,
            )),
        }
    }

    /// Load a saga by its correlation property value.
    ///
    /// The id is derived the same way [`save`] derives it, so no lookup
    /// index is involved.
    ///
    /// [`save`]: SagaPersister::save
    pub async fn get_by_correlation<T: SagaData>(
        &self,
        correlation_value: &str,
        session: &mut StorageSession,
    ) -> Result<Option<SagaRecord<T>>, PersistenceError<C::Error>> {
        let saga_id =
            SagaIdGenerator::generate(T::ENTITY_TYPE, T::CORRELATION_PROPERTY, correlation_value);
        self.get(saga_id, session).await
    }

    /// Queue the creation of a new saga.
    ///
    /// The id is derived from the correlation value, so two processes
    /// starting the same logical saga race on the same document id and
    /// the store lets exactly one create through; the loser surfaces a
    /// conflict at commit.
    pub fn save<T: SagaData>(
        &self,
        data: &T,
        session: &mut StorageSession,
    ) -> Result<Uuid, PersistenceError<C::Error>> {
        let saga_id = SagaIdGenerator::for_data(data);
        let document_id = saga_id.to_string();
        let document = envelope::wrap(saga_id, data, &SagaMetadata::current())
            .map_err(PersistenceError::envelope)?;
        session.push(
            BatchOperation::Create {
                id: document_id.clone(),
                document,
            },
            ConflictHandler::Concurrency { document_id },
        );
        debug!(%saga_id, entity_type = T::ENTITY_TYPE, "queued saga create");
        Ok(saga_id)
    }

    /// Queue an update of an existing saga.
    ///
    /// The replace is conditioned on the version tag recorded by the
    /// [`get`] that produced the record, so a concurrent writer who got
    /// their commit in first turns this unit of work into a conflict.
    /// Metadata read with the record is written back unchanged, keeping
    /// migration bookkeeping intact.
    ///
    /// [`get`]: SagaPersister::get
    pub fn update<T: SagaData>(
        &self,
        record: &SagaRecord<T>,
        session: &mut StorageSession,
    ) -> Result<(), PersistenceError<C::Error>> {
        let document_id = record.saga_id.to_string();
        let version =
            session
                .version_of(&document_id)
                .ok_or(PersistenceError::NotReadInSession {
                    saga_id: record.saga_id,
                })?;
        let document = envelope::wrap(record.saga_id, &record.data, &record.metadata)
            .map_err(PersistenceError::envelope)?;
        session.push(
            BatchOperation::Replace {
                id: document_id.clone(),
                document,
                if_version: Some(version),
            },
            ConflictHandler::Concurrency { document_id },
        );
        debug!(saga_id = %record.saga_id, "queued saga update");
        Ok(())
    }

    /// Queue the completion of a saga, removing its document.
    ///
    /// The delete is conditioned on the version tag recorded by [`get`],
    /// so a concurrent writer who changed the saga first wins and this
    /// unit of work conflicts. Completing a saga that was never stored,
    /// started and finished inside one unit of work, queues nothing.
    ///
    /// [`get`]: SagaPersister::get
    pub fn complete<T: SagaData>(
        &self,
        record: &SagaRecord<T>,
        session: &mut StorageSession,
    ) -> Result<(), PersistenceError<C::Error>> {
        let document_id = record.saga_id.to_string();
        match session.version_of(&document_id) {
            Some(version) => {
                session.push(
                    BatchOperation::Delete {
                        id: document_id.clone(),
                        if_version: Some(version),
                    },
                    ConflictHandler::Concurrency { document_id },
                );
                debug!(saga_id = %record.saga_id, "queued saga completion");
            }
            None => {
                debug!(
                    saga_id = %record.saga_id,
                    "saga completed without ever reaching the store; nothing to delete"
                );
            }
        }
        Ok(())
    }

    /// Commit a unit of work: execute every queued operation in one
    /// atomic batch.
    ///
    /// The first non-success result is translated by the handler
    /// registered with its operation; since the batch is atomic, no
    /// operation took effect in that case. Leases held by the session are
    /// released whether the batch committed or not.
    pub async fn commit(
        &self,
        mut session: StorageSession,
    ) -> Result<(), PersistenceError<C::Error>> {
        let outcome = self.flush(&mut session).await;
        self.release_leases(&mut session).await;
        outcome
    }

    /// Abandon a unit of work: discard queued operations and release any
    /// held leases.
    pub async fn rollback(&self, mut session: StorageSession) {
        let discarded = session.take_pending().len();
        if discarded > 0 {
            debug!(discarded, "unit of work rolled back; queued operations discarded");
        }
        self.release_leases(&mut session).await;
    }

    async fn flush(
        &self,
        session: &mut StorageSession,
    ) -> Result<(), PersistenceError<C::Error>> {
        let pending = session.take_pending();
        if pending.is_empty() {
            return Ok(());
        }
        let operations: Vec<BatchOperation> =
            pending.iter().map(|item| item.operation.clone()).collect();
        let results = self
            .container
            .execute_batch(session.partition_key(), operations)
            .await?;
        if results.len() != pending.len() {
            return Err(PersistenceError::ShapeMismatch {
                submitted: pending.len(),
                returned: results.len(),
            });
        }
        for (item, result) in pending.iter().zip(results.iter()) {
            if !result.is_success() {
                return Err(item.on_conflict.raise(&item.operation, result.status));
            }
        }
        debug!(
            partition_key = %session.partition_key(),
            operations = pending.len(),
            "unit of work committed"
        );
        Ok(())
    }

    async fn release_leases(&self, session: &mut StorageSession) {
        for lease in session.take_leases() {
            let saga_id = lease.saga_id();
            if let Err(error) = self.lock.release(lease).await {
                warn!(
                    %saga_id,
                    %error,
                    "failed to release saga lease; writers stay blocked until it expires"
                );
            }
        }
    }
}
