//! Saga state persistence.
//!
//! Saga state lives as one JSON document per saga instance, addressed by a
//! deterministic id derived from the correlation property. The submodules
//! split the concern:
//! - [`identity`] derives stable saga ids
//! - [`envelope`] wraps business state into the stored document shape
//! - [`persister`] reads and writes saga documents through a unit of work
//! - [`lock`] serializes writers in pessimistic mode

pub mod envelope;
pub mod identity;
pub mod lock;
pub mod persister;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Contract a saga state type must fulfil to be persisted.
///
/// The two associated constants feed the deterministic id derivation, so
/// they must stay stable for the lifetime of stored data. Renaming the
/// type or the correlation property orphans every existing instance.
pub trait SagaData: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable, namespace-qualified name of the saga state type.
    const ENTITY_TYPE: &'static str;

    /// Name of the property new instances correlate on.
    const CORRELATION_PROPERTY: &'static str;

    /// Current value of the correlation property, stringified the same way
    /// incoming messages stringify it.
    fn correlation_value(&self) -> String;
}
