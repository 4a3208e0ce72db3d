//! Outbox record persistence.
//!
//! The outbox gives message handlers exactly-once semantics over an
//! at-least-once transport: the messages a handler wants to send are
//! stored in the same atomic batch as its saga state change, then
//! dispatched afterwards and marked as such. Redelivery of the incoming
//! message finds the stored record and skips the handler entirely.

use crate::container::{
    expect_single, BatchOperation, DocumentContainer, OperationStatus, PartitionKey,
};
use crate::error::PersistenceError;
use crate::saga::envelope::METADATA_KEY;
use crate::session::{ConflictHandler, StorageSession};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Metadata key recording the outbox storage schema version.
pub const OUTBOX_SCHEMA_VERSION_KEY: &str = "OutboxDataContainer-SchemaVersion";

/// Current outbox storage schema version.
pub const OUTBOX_SCHEMA_VERSION: &str = "1.0.0";

/// Bookkeeping carried alongside every outbox document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMetadata {
    /// Storage schema version the document was written with.
    #[serde(rename = "OutboxDataContainer-SchemaVersion")]
    pub schema_version: String,
}

impl OutboxMetadata {
    /// Metadata for a document written by this persister.
    pub fn current() -> Self {
        Self {
            schema_version: OUTBOX_SCHEMA_VERSION.to_string(),
        }
    }
}

/// One outgoing message captured by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOperation {
    /// Id of the outgoing message.
    pub message_id: String,
    /// Destination address or topic.
    pub destination: String,
    /// Message headers. Ordered so stored documents are stable.
    pub headers: BTreeMap<String, String>,
    /// Serialized message body.
    pub body: Value,
}

/// The stored outcome of processing one incoming message.
///
/// While `dispatched` is false the record still carries the transport
/// operations to send. [`OutboxPersister::set_dispatched`] empties them,
/// leaving a tombstone that only serves deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxRecord {
    /// Id of the incoming message this record belongs to.
    #[serde(rename = "id")]
    pub message_id: String,
    /// Whether the captured operations were already sent.
    pub dispatched: bool,
    /// When dispatch finished, if it did.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub dispatched_at: Option<DateTime<Utc>>,
    /// The messages to send, empty once dispatched.
    pub transport_operations: Vec<TransportOperation>,
}

impl OutboxRecord {
    /// A fresh record capturing the operations of one handler run.
    pub fn new(message_id: impl Into<String>, operations: Vec<TransportOperation>) -> Self {
        Self {
            message_id: message_id.into(),
            dispatched: false,
            dispatched_at: None,
            transport_operations: operations,
        }
    }

    fn dispatched_tombstone(message_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            message_id: message_id.into(),
            dispatched: true,
            dispatched_at: Some(at),
            transport_operations: Vec::new(),
        }
    }
}

/// Wrap an outbox record into the stored document shape: metadata first,
/// then the record's own properties starting with the id.
fn wrap(record: &OutboxRecord) -> Result<Value, serde_json::Error> {
    let body = serde_json::to_value(record)?;
    let mut document = Map::new();
    document.insert(
        METADATA_KEY.to_string(),
        serde_json::to_value(OutboxMetadata::current())?,
    );
    if let Value::Object(body) = body {
        for (key, value) in body {
            document.insert(key, value);
        }
    }
    Ok(Value::Object(document))
}

fn unwrap(document: &Value) -> Result<OutboxRecord, serde_json::Error> {
    let mut body = document.clone();
    if let Some(object) = body.as_object_mut() {
        object.remove(METADATA_KEY);
    }
    serde_json::from_value(body)
}

/// Reads and writes outbox records through the container.
pub struct OutboxPersister<C> {
    container: Arc<C>,
}

impl<C: DocumentContainer> OutboxPersister<C> {
    /// Create a persister over a container.
    pub fn new(container: Arc<C>) -> Self {
        Self { container }
    }

    /// Load the outbox record for an incoming message id.
    ///
    /// `Some` means the message was processed before; a record with
    /// `dispatched == false` still carries the operations to send.
    pub async fn get(
        &self,
        message_id: &str,
        partition_key: &PartitionKey,
    ) -> Result<Option<OutboxRecord>, PersistenceError<C::Error>> {
        let read = self.container.read_by_id(message_id, partition_key).await?;
        match read.status {
            OperationStatus::NotFound => Ok(None),
            status if status.is_success() => {
                let document = read.document.ok_or_else(|| {
                    PersistenceError::envelope("store returned success without a document body")
                })?;
                let record = unwrap(&document).map_err(PersistenceError::envelope)?;
                Ok(Some(record))
            }
            other => Err(PersistenceError::unexpected_status(
                "read",
                message_id.to_string(),
                other,
            )),
        }
    }

    /// Queue an outbox record into the unit of work.
    ///
    /// The record joins the saga operations in the same atomic batch, so
    /// state change and captured messages are stored together or not at
    /// all. Two processors racing the same incoming message collide on
    /// the record id; the loser sees a typed conflict at commit.
    pub fn store(
        &self,
        record: &OutboxRecord,
        session: &mut StorageSession,
    ) -> Result<(), PersistenceError<C::Error>> {
        let document = wrap(record).map_err(PersistenceError::envelope)?;
        session.push(
            BatchOperation::Create {
                id: record.message_id.clone(),
                document,
            },
            ConflictHandler::Concurrency {
                document_id: record.message_id.clone(),
            },
        );
        debug!(
            message_id = %record.message_id,
            operations = record.transport_operations.len(),
            "queued outbox record"
        );
        Ok(())
    }

    /// Mark a record as dispatched, dropping its payload.
    ///
    /// Runs immediately rather than through a session: dispatch already
    /// happened, so the tombstone must land even if the caller abandons
    /// its current unit of work. The upsert is unconditional; marking an
    /// already-dispatched record again is harmless.
    pub async fn set_dispatched(
        &self,
        message_id: &str,
        partition_key: &PartitionKey,
    ) -> Result<(), PersistenceError<C::Error>> {
        let tombstone = OutboxRecord::dispatched_tombstone(message_id, Utc::now());
        let document = wrap(&tombstone).map_err(PersistenceError::envelope)?;
        let results = self
            .container
            .execute_batch(
                partition_key,
                vec![BatchOperation::Upsert {
                    id: message_id.to_string(),
                    document,
                }],
            )
            .await?;
        let result = expect_single(results)?;
        if !result.is_success() {
            return Err(PersistenceError::unexpected_status(
                "upsert",
                message_id.to_string(),
                result.status,
            ));
        }
        debug!(message_id, "outbox record marked dispatched");
        Ok(())
    }
}
