//! Lease-based pessimistic lock for saga writers.
//!
//! In pessimistic mode every writer acquires a lease document next to the
//! saga document before reading state. The lease carries an expiry and a
//! holder token; a writer that crashes without releasing simply lets the
//! lease expire, after which any contender takes it over with a
//! conditional replace. Acquisition polls with a randomized delay so
//! contenders do not hammer the store in step.

use crate::config::{ConfigurationError, LockConfig};
use crate::container::{
    expect_single, BatchOperation, DocumentContainer, OperationStatus, PartitionKey, VersionTag,
};
use crate::error::PersistenceError;
use crate::saga::envelope::DOCUMENT_ID_KEY;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Suffix appended to the saga id to form the lease document id.
pub const LEASE_ID_SUFFIX: &str = "-lock";

/// Document key holding the lease expiry, RFC 3339.
pub const LEASE_EXPIRY_KEY: &str = "leaseExpiry";

/// Document key holding the current holder's token.
pub const LEASE_HOLDER_KEY: &str = "leaseHolderToken";

/// Lifecycle of a lease as one holder sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Not held by this holder.
    Unlocked,
    /// This holder is polling for the lease.
    Acquiring,
    /// This holder owns the lease until its expiry.
    Held,
    /// This holder is giving the lease back.
    Releasing,
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlocked => write!(f, "unlocked"),
            Self::Acquiring => write!(f, "acquiring"),
            Self::Held => write!(f, "held"),
            Self::Releasing => write!(f, "releasing"),
        }
    }
}

/// A lease this process currently holds on a saga.
///
/// Obtained from [`LeaseLockManager::acquire`] and given back through
/// [`LeaseLockManager::release`]; sessions do both automatically in
/// pessimistic mode.
#[derive(Debug)]
pub struct SagaLease {
    saga_id: Uuid,
    lease_id: String,
    partition_key: PartitionKey,
    holder_token: Uuid,
    version: VersionTag,
    expires_at: DateTime<Utc>,
    state: LeaseState,
}

impl SagaLease {
    pub(crate) fn held(
        saga_id: Uuid,
        lease_id: String,
        partition_key: PartitionKey,
        holder_token: Uuid,
        version: VersionTag,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            saga_id,
            lease_id,
            partition_key,
            holder_token,
            version,
            expires_at,
            state: LeaseState::Held,
        }
    }

    /// The saga this lease guards.
    pub fn saga_id(&self) -> Uuid {
        self.saga_id
    }

    /// Id of the lease document in the store.
    pub fn lease_id(&self) -> &str {
        &self.lease_id
    }

    /// Partition the lease document lives in.
    pub fn partition_key(&self) -> &PartitionKey {
        &self.partition_key
    }

    /// Token identifying this holder's acquisition.
    pub fn holder_token(&self) -> Uuid {
        self.holder_token
    }

    /// When the lease lapses if not refreshed or released.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LeaseState {
        self.state
    }
}

/// Id of the lease document guarding a saga.
pub fn lease_document_id(saga_id: Uuid) -> String {
    format!("{}{}", saga_id, LEASE_ID_SUFFIX)
}

/// Acquires, refreshes and releases saga leases through the container.
pub struct LeaseLockManager<C> {
    container: Arc<C>,
    config: LockConfig,
}

impl<C: DocumentContainer> LeaseLockManager<C> {
    /// Create a manager over a container.
    ///
    /// Fails fast on invalid lock configuration.
    pub fn new(container: Arc<C>, config: LockConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self { container, config })
    }

    /// The lock configuration in effect.
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquire the lease for a saga, polling until it is free or the
    /// acquisition timeout lapses.
    ///
    /// # Errors
    ///
    /// [`PersistenceError::LockTimeout`] when the lease stayed contested
    /// for the whole acquisition window.
    pub async fn acquire(
        &self,
        saga_id: Uuid,
        partition_key: &PartitionKey,
    ) -> Result<SagaLease, PersistenceError<C::Error>> {
        let started = Instant::now();
        debug!(%saga_id, state = %LeaseState::Acquiring, "acquiring saga lease");
        loop {
            if let Some(lease) = self.try_acquire(saga_id, partition_key).await? {
                debug!(
                    %saga_id,
                    holder_token = %lease.holder_token(),
                    state = %lease.state(),
                    "saga lease acquired"
                );
                return Ok(lease);
            }
            let waited = started.elapsed();
            if waited >= self.config.acquisition_timeout {
                return Err(PersistenceError::LockTimeout {
                    saga_id,
                    waited_ms: waited.as_millis() as u64,
                });
            }
            let delay = jittered_delay(
                self.config.minimum_refresh_delay,
                self.config.maximum_refresh_delay,
            );
            // Do not sleep past the deadline just to discover the timeout.
            let remaining = self.config.acquisition_timeout.saturating_sub(waited);
            tokio::time::sleep(delay.min(remaining)).await;
        }
    }

    /// One acquisition attempt. `None` means the lease is validly held by
    /// someone else right now.
    async fn try_acquire(
        &self,
        saga_id: Uuid,
        partition_key: &PartitionKey,
    ) -> Result<Option<SagaLease>, PersistenceError<C::Error>> {
        let lease_id = lease_document_id(saga_id);
        let holder_token = Uuid::new_v4();
        let expires_at = self.lease_expiry(Utc::now());
        let document = lease_document(&lease_id, holder_token, expires_at);

        let results = self
            .container
            .execute_batch(
                partition_key,
                vec![BatchOperation::Create {
                    id: lease_id.clone(),
                    document,
                }],
            )
            .await?;
        let result = expect_single(results)?;

        match result.status {
            status if status.is_success() => {
                let version = result.version.ok_or_else(|| {
                    PersistenceError::MissingVersionTag {
                        document_id: lease_id.clone(),
                    }
                })?;
                Ok(Some(SagaLease::held(
                    saga_id,
                    lease_id,
                    partition_key.clone(),
                    holder_token,
                    version,
                    expires_at,
                )))
            }
            OperationStatus::Conflict => {
                self.try_take_over(saga_id, &lease_id, partition_key).await
            }
            other => Err(PersistenceError::unexpected_status(
                "create",
                lease_id,
                other,
            )),
        }
    }

    /// The lease document already exists. Take it over if its expiry has
    /// passed, conditioned on the version we read so only one contender
    /// wins.
    async fn try_take_over(
        &self,
        saga_id: Uuid,
        lease_id: &str,
        partition_key: &PartitionKey,
    ) -> Result<Option<SagaLease>, PersistenceError<C::Error>> {
        let current = self.container.read_by_id(lease_id, partition_key).await?;
        match current.status {
            // Released between our create attempt and this read; the next
            // attempt will create it.
            OperationStatus::NotFound => Ok(None),
            status if status.is_success() => {
                let version = current.version.ok_or_else(|| {
                    PersistenceError::MissingVersionTag {
                        document_id: lease_id.to_string(),
                    }
                })?;
                let now = Utc::now();
                let expiry = current.document.as_ref().and_then(parse_lease_expiry);
                match expiry {
                    Some(expiry) if expiry > now => {
                        debug!(%saga_id, %expiry, "lease held by another writer");
                        Ok(None)
                    }
                    expiry => {
                        if expiry.is_none() {
                            warn!(
                                lease_id,
                                "lease document has no readable expiry; treating it as expired"
                            );
                        }
                        self.replace_expired(saga_id, lease_id, partition_key, version)
                            .await
                    }
                }
            }
            other => Err(PersistenceError::unexpected_status(
                "read",
                lease_id.to_string(),
                other,
            )),
        }
    }

    async fn replace_expired(
        &self,
        saga_id: Uuid,
        lease_id: &str,
        partition_key: &PartitionKey,
        observed_version: VersionTag,
    ) -> Result<Option<SagaLease>, PersistenceError<C::Error>> {
        let holder_token = Uuid::new_v4();
        let expires_at = self.lease_expiry(Utc::now());
        let document = lease_document(lease_id, holder_token, expires_at);

        let results = self
            .container
            .execute_batch(
                partition_key,
                vec![BatchOperation::Replace {
                    id: lease_id.to_string(),
                    document,
                    if_version: Some(observed_version),
                }],
            )
            .await?;
        let result = expect_single(results)?;

        match result.status {
            status if status.is_success() => {
                let version = result.version.ok_or_else(|| {
                    PersistenceError::MissingVersionTag {
                        document_id: lease_id.to_string(),
                    }
                })?;
                debug!(%saga_id, "took over an expired lease");
                Ok(Some(SagaLease::held(
                    saga_id,
                    lease_id.to_string(),
                    partition_key.clone(),
                    holder_token,
                    version,
                    expires_at,
                )))
            }
            status if status.is_concurrency_signal() => {
                debug!(%saga_id, "lost the takeover race for an expired lease");
                Ok(None)
            }
            other => Err(PersistenceError::unexpected_status(
                "replace",
                lease_id.to_string(),
                other,
            )),
        }
    }

    /// Extend a held lease by a fresh lease duration.
    ///
    /// Long-running handlers call this to keep contenders from treating
    /// them as crashed. Only valid while the lease is held.
    pub async fn refresh(
        &self,
        lease: &mut SagaLease,
    ) -> Result<(), PersistenceError<C::Error>> {
        if lease.state != LeaseState::Held {
            return Err(PersistenceError::LeaseNotHeld {
                saga_id: lease.saga_id,
                state: lease.state,
            });
        }
        let expires_at = self.lease_expiry(Utc::now());
        let document = lease_document(&lease.lease_id, lease.holder_token, expires_at);

        let results = self
            .container
            .execute_batch(
                &lease.partition_key,
                vec![BatchOperation::Replace {
                    id: lease.lease_id.clone(),
                    document,
                    if_version: Some(lease.version.clone()),
                }],
            )
            .await?;
        let result = expect_single(results)?;

        match result.status {
            status if status.is_success() => {
                lease.version = result.version.ok_or_else(|| {
                    PersistenceError::MissingVersionTag {
                        document_id: lease.lease_id.clone(),
                    }
                })?;
                lease.expires_at = expires_at;
                debug!(saga_id = %lease.saga_id, %expires_at, "saga lease refreshed");
                Ok(())
            }
            status if status.is_concurrency_signal() => {
                lease.state = LeaseState::Unlocked;
                Err(PersistenceError::LeaseLost {
                    saga_id: lease.saga_id,
                })
            }
            other => Err(PersistenceError::unexpected_status(
                "replace",
                lease.lease_id.clone(),
                other,
            )),
        }
    }

    /// Give a lease back.
    ///
    /// The delete is conditioned on the version this holder last observed,
    /// so a lease another writer already took over after expiry is left
    /// alone and the release still counts as done.
    pub async fn release(&self, mut lease: SagaLease) -> Result<(), PersistenceError<C::Error>> {
        lease.state = LeaseState::Releasing;
        let results = self
            .container
            .execute_batch(
                &lease.partition_key,
                vec![BatchOperation::Delete {
                    id: lease.lease_id.clone(),
                    if_version: Some(lease.version.clone()),
                }],
            )
            .await?;
        let result = expect_single(results)?;

        match result.status {
            status if status.is_success() => {
                debug!(saga_id = %lease.saga_id, state = %LeaseState::Unlocked, "saga lease released");
                Ok(())
            }
            status if status.is_concurrency_signal() => {
                debug!(
                    saga_id = %lease.saga_id,
                    status = %status,
                    "lease superseded before release; nothing to give back"
                );
                Ok(())
            }
            other => Err(PersistenceError::unexpected_status(
                "delete",
                lease.lease_id.clone(),
                other,
            )),
        }
    }

    fn lease_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match chrono::Duration::from_std(self.config.lease_duration) {
            Ok(delta) => now
                .checked_add_signed(delta)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            Err(_) => DateTime::<Utc>::MAX_UTC,
        }
    }
}

/// The lease document body.
fn lease_document(lease_id: &str, holder_token: Uuid, expires_at: DateTime<Utc>) -> Value {
    let mut document = Map::with_capacity(3);
    document.insert(
        DOCUMENT_ID_KEY.to_string(),
        Value::String(lease_id.to_string()),
    );
    document.insert(
        LEASE_EXPIRY_KEY.to_string(),
        Value::String(expires_at.to_rfc3339()),
    );
    document.insert(
        LEASE_HOLDER_KEY.to_string(),
        Value::String(holder_token.to_string()),
    );
    Value::Object(document)
}

fn parse_lease_expiry(document: &Value) -> Option<DateTime<Utc>> {
    document
        .get(LEASE_EXPIRY_KEY)?
        .as_str()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// A uniformly random delay between acquisition attempts, so contenders
/// spread out instead of retrying in step.
fn jittered_delay(minimum: Duration, maximum: Duration) -> Duration {
    let min_ms = minimum.as_millis() as u64;
    let max_ms = maximum.as_millis() as u64;
    if min_ms >= max_ms {
        return minimum;
    }
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_document_id_appends_the_suffix() {
        let saga_id = Uuid::parse_str("018b4279-02d5-782e-b2d0-7c83f14a8427").unwrap();
        assert_eq!(
            lease_document_id(saga_id),
            "018b4279-02d5-782e-b2d0-7c83f14a8427-lock"
        );
    }

    #[test]
    fn lease_document_round_trips_its_expiry() {
        let expires_at = Utc::now();
        let document = lease_document("saga-1-lock", Uuid::new_v4(), expires_at);

        let parsed = parse_lease_expiry(&document).unwrap();
        assert_eq!(parsed, expires_at);
        assert_eq!(document[DOCUMENT_ID_KEY], "saga-1-lock");
        assert!(document[LEASE_HOLDER_KEY].is_string());
    }

    #[test]
    fn unreadable_expiry_parses_to_none() {
        let document = serde_json::json!({
            "id": "saga-1-lock",
            LEASE_EXPIRY_KEY: "sometime later",
        });
        assert!(parse_lease_expiry(&document).is_none());
        assert!(parse_lease_expiry(&serde_json::json!({})).is_none());
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let min = Duration::from_millis(20);
        let max = Duration::from_millis(40);
        for _ in 0..100 {
            let delay = jittered_delay(min, max);
            assert!(delay >= min && delay <= max);
        }
    }

    #[test]
    fn jittered_delay_with_collapsed_window_is_constant() {
        let d = Duration::from_millis(30);
        assert_eq!(jittered_delay(d, d), d);
    }

    #[test]
    fn lease_state_display_names() {
        assert_eq!(LeaseState::Unlocked.to_string(), "unlocked");
        assert_eq!(LeaseState::Acquiring.to_string(), "acquiring");
        assert_eq!(LeaseState::Held.to_string(), "held");
        assert_eq!(LeaseState::Releasing.to_string(), "releasing");
    }
}
