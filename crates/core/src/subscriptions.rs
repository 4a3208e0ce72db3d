//! Message-driven pub/sub subscription storage.
//!
//! Each event type owns one partition holding a single document with the
//! current subscriber list. Updates go through an optimistic
//! read-modify-replace loop conditioned on the observed version tag, so
//! concurrent endpoints registering at startup never clobber each other's
//! entries.

use crate::container::{
    expect_single, BatchOperation, DocumentContainer, OperationStatus, PartitionKey,
};
use crate::error::PersistenceError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Id of the subscriber-list document inside each event type partition.
pub const SUBSCRIBERS_DOCUMENT_ID: &str = "subscribers";

/// Attempts before a subscription write gives up on its optimistic loop.
const WRITE_ATTEMPTS: usize = 8;

/// One subscribing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    /// Address messages for this subscriber are sent to.
    #[serde(rename = "transportAddress")]
    pub transport_address: String,
    /// Logical endpoint name, when the subscriber advertises one.
    #[serde(rename = "endpoint", skip_serializing_if = "Option::is_none", default)]
    pub endpoint: Option<String>,
}

impl Subscriber {
    /// A subscriber known only by its transport address.
    pub fn new(transport_address: impl Into<String>) -> Self {
        Self {
            transport_address: transport_address.into(),
            endpoint: None,
        }
    }

    /// Attach the logical endpoint name.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// Stored subscriber list for one event type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriberList {
    #[serde(rename = "id")]
    id: String,
    event_type: String,
    subscribers: Vec<Subscriber>,
}

impl SubscriberList {
    fn new(event_type: &str) -> Self {
        Self {
            id: SUBSCRIBERS_DOCUMENT_ID.to_string(),
            event_type: event_type.to_string(),
            subscribers: Vec::new(),
        }
    }
}

/// Insert or refresh a subscriber entry, keyed by transport address.
///
/// Returns false when the list already carried an identical entry.
fn upsert_subscriber(list: &mut Vec<Subscriber>, subscriber: Subscriber) -> bool {
    match list
        .iter_mut()
        .find(|existing| existing.transport_address == subscriber.transport_address)
    {
        Some(existing) if *existing == subscriber => false,
        Some(existing) => {
            *existing = subscriber;
            true
        }
        None => {
            list.push(subscriber);
            true
        }
    }
}

/// Drop a subscriber entry by transport address.
///
/// Returns false when no entry matched.
fn remove_subscriber(list: &mut Vec<Subscriber>, transport_address: &str) -> bool {
    let before = list.len();
    list.retain(|existing| existing.transport_address != transport_address);
    list.len() != before
}

/// Reads and writes subscriber lists through the container.
pub struct SubscriptionStore<C> {
    container: Arc<C>,
}

impl<C: DocumentContainer> SubscriptionStore<C> {
    /// Create a store over a container.
    pub fn new(container: Arc<C>) -> Self {
        Self { container }
    }

    /// Register a subscriber for an event type.
    ///
    /// Registering the same subscriber again is a no-op; registering with
    /// a changed endpoint name refreshes the stored entry.
    pub async fn subscribe(
        &self,
        event_type: &str,
        subscriber: Subscriber,
    ) -> Result<(), PersistenceError<C::Error>> {
        let partition_key = PartitionKey::new(event_type);
        for _ in 0..WRITE_ATTEMPTS {
            let read = self
                .container
                .read_by_id(SUBSCRIBERS_DOCUMENT_ID, &partition_key)
                .await?;
            match read.status {
                OperationStatus::NotFound => {
                    let mut list = SubscriberList::new(event_type);
                    list.subscribers.push(subscriber.clone());
                    let document =
                        serde_json::to_value(&list).map_err(PersistenceError::envelope)?;
                    let results = self
                        .container
                        .execute_batch(
                            &partition_key,
                            vec![BatchOperation::Create {
                                id: SUBSCRIBERS_DOCUMENT_ID.to_string(),
                                document,
                            }],
                        )
                        .await?;
                    let result = expect_single(results)?;
                    match result.status {
                        status if status.is_success() => {
                            debug!(event_type, subscriber = %subscriber.transport_address, "subscribed");
                            return Ok(());
                        }
                        // Another endpoint created the list first; reread
                        // and take the replace path.
                        OperationStatus::Conflict => continue,
                        other => {
                            return Err(PersistenceError::unexpected_status(
                                "create",
                                SUBSCRIBERS_DOCUMENT_ID,
                                other,
                            ))
                        }
                    }
                }
                status if status.is_success() => {
                    let version =
                        read.version
                            .ok_or_else(|| PersistenceError::MissingVersionTag {
                                document_id: SUBSCRIBERS_DOCUMENT_ID.to_string(),
                            })?;
                    let document = read.document.ok_or_else(|| {
                        PersistenceError::envelope("store returned success without a document body")
                    })?;
                    let mut list: SubscriberList =
                        serde_json::from_value(document).map_err(PersistenceError::envelope)?;
                    if !upsert_subscriber(&mut list.subscribers, subscriber.clone()) {
                        return Ok(());
                    }
                    let document =
                        serde_json::to_value(&list).map_err(PersistenceError::envelope)?;
                    let results = self
                        .container
                        .execute_batch(
                            &partition_key,
                            vec![BatchOperation::Replace {
                                id: SUBSCRIBERS_DOCUMENT_ID.to_string(),
                                document,
                                if_version: Some(version),
                            }],
                        )
                        .await?;
                    let result = expect_single(results)?;
                    match result.status {
                        status if status.is_success() => {
                            debug!(event_type, subscriber = %subscriber.transport_address, "subscribed");
                            return Ok(());
                        }
                        status if status.is_concurrency_signal() => continue,
                        other => {
                            return Err(PersistenceError::unexpected_status(
                                "replace",
                                SUBSCRIBERS_DOCUMENT_ID,
                                other,
                            ))
                        }
                    }
                }
                other => {
                    return Err(PersistenceError::unexpected_status(
                        "read",
                        SUBSCRIBERS_DOCUMENT_ID,
                        other,
                    ))
                }
            }
        }
        Err(PersistenceError::conflict(event_type))
    }

    /// Remove a subscriber from an event type.
    ///
    /// Unknown subscribers and unknown event types are no-ops. Removing
    /// the last subscriber removes the list document itself.
    pub async fn unsubscribe(
        &self,
        event_type: &str,
        transport_address: &str,
    ) -> Result<(), PersistenceError<C::Error>> {
        let partition_key = PartitionKey::new(event_type);
        for _ in 0..WRITE_ATTEMPTS {
            let read = self
                .container
                .read_by_id(SUBSCRIBERS_DOCUMENT_ID, &partition_key)
                .await?;
            match read.status {
                OperationStatus::NotFound => return Ok(()),
                status if status.is_success() => {
                    let version =
                        read.version
                            .ok_or_else(|| PersistenceError::MissingVersionTag {
                                document_id: SUBSCRIBERS_DOCUMENT_ID.to_string(),
                            })?;
                    let document = read.document.ok_or_else(|| {
                        PersistenceError::envelope("store returned success without a document body")
                    })?;
                    let mut list: SubscriberList =
                        serde_json::from_value(document).map_err(PersistenceError::envelope)?;
                    if !remove_subscriber(&mut list.subscribers, transport_address) {
                        return Ok(());
                    }
                    let operation = if list.subscribers.is_empty() {
                        BatchOperation::Delete {
                            id: SUBSCRIBERS_DOCUMENT_ID.to_string(),
                            if_version: Some(version),
                        }
                    } else {
                        let document =
                            serde_json::to_value(&list).map_err(PersistenceError::envelope)?;
                        BatchOperation::Replace {
                            id: SUBSCRIBERS_DOCUMENT_ID.to_string(),
                            document,
                            if_version: Some(version),
                        }
                    };
                    let results = self
                        .container
                        .execute_batch(&partition_key, vec![operation])
                        .await?;
                    let result = expect_single(results)?;
                    match result.status {
                        status if status.is_success() => {
                            debug!(event_type, subscriber = transport_address, "unsubscribed");
                            return Ok(());
                        }
                        status if status.is_concurrency_signal() => continue,
                        other => {
                            return Err(PersistenceError::unexpected_status(
                                "write",
                                SUBSCRIBERS_DOCUMENT_ID,
                                other,
                            ))
                        }
                    }
                }
                other => {
                    return Err(PersistenceError::unexpected_status(
                        "read",
                        SUBSCRIBERS_DOCUMENT_ID,
                        other,
                    ))
                }
            }
        }
        Err(PersistenceError::conflict(event_type))
    }

    /// Collect the subscribers of every given event type.
    ///
    /// Duplicate transport addresses across event types collapse into one
    /// entry. The result is ordered by transport address.
    pub async fn subscribers_for(
        &self,
        event_types: &[&str],
    ) -> Result<Vec<Subscriber>, PersistenceError<C::Error>> {
        let mut merged: BTreeMap<String, Subscriber> = BTreeMap::new();
        for event_type in event_types {
            let partition_key = PartitionKey::new(*event_type);
            let read = self
                .container
                .read_by_id(SUBSCRIBERS_DOCUMENT_ID, &partition_key)
                .await?;
            match read.status {
                OperationStatus::NotFound => continue,
                status if status.is_success() => {
                    let document = read.document.ok_or_else(|| {
                        PersistenceError::envelope("store returned success without a document body")
                    })?;
                    let list: SubscriberList =
                        serde_json::from_value(document).map_err(PersistenceError::envelope)?;
                    for subscriber in list.subscribers {
                        merged.insert(subscriber.transport_address.clone(), subscriber);
                    }
                }
                other => {
                    return Err(PersistenceError::unexpected_status(
                        "read",
                        SUBSCRIBERS_DOCUMENT_ID,
                        other,
                    ))
                }
            }
        }
        Ok(merged.into_values().collect())
    }
}
