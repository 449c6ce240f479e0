//! The persistence backend collaborator.

use async_trait::async_trait;

use crate::{BackendError, DocumentKey};

/// Bounds every document value must meet: cheap enough to clone out of
/// the cache and shareable across tasks.
pub trait Record: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Record for T {}

/// The result of opening a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedRecord<T> {
    /// The stored value, or a default one if the record was just created.
    pub value: T,
    /// `true` if no record existed and the backend created one.
    pub fresh: bool,
}

/// A remote store of records.
///
/// Implementations are expected to be slow and unreliable: every call may
/// fail with a [`BackendError`]. Opening a record also acquires the
/// backend's session lock on it (stealing it from a previous holder);
/// [`release`](Backend::release) writes the final value and gives the lock
/// up.
///
/// `#[async_trait]` keeps the trait object-safe, so a store can hold an
/// `Arc<dyn Backend<T>>` and the backend choice stays a runtime decision.
#[async_trait]
pub trait Backend<T: Record>: Send + Sync + 'static {
    /// Loads (or creates) the record for `key` and takes its session lock.
    async fn open(&self, key: &DocumentKey) -> Result<OpenedRecord<T>, BackendError>;

    /// Persists `value` as the record for `key`.
    async fn write(&self, key: &DocumentKey, value: &T) -> Result<(), BackendError>;

    /// Persists `value` one last time and releases the session lock.
    async fn release(&self, key: &DocumentKey, value: &T) -> Result<(), BackendError>;
}
