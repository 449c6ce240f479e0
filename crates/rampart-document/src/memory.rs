//! An in-process [`Backend`] with fault injection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::{Backend, BackendError, DocumentKey, OpenedRecord, Record};

/// Schema version a [`MemoryBackend`] understands unless told otherwise.
pub const DEFAULT_SCHEMA_VERSION: u32 = 1;

/// A record as the backend holds it: the value plus the schema version
/// of the server that last wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord<T> {
    pub schema_version: u32,
    pub value: T,
}

/// Backend calls made for one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyStats {
    pub opens: u32,
    pub writes: u32,
    pub releases: u32,
}

struct MemoryState<T> {
    records: HashMap<DocumentKey, StoredRecord<T>>,
    locked: HashSet<DocumentKey>,
    stats: HashMap<DocumentKey, KeyStats>,
    open_faults: HashMap<DocumentKey, VecDeque<BackendError>>,
    write_faults: HashMap<DocumentKey, BackendError>,
}

/// Keeps records in a map. Used by the demo server and the tests.
///
/// Every call first sleeps for the configured latency (zero by default),
/// which gives concurrent callers a window to overlap. Faults are queued
/// per key and consumed one per call:
///
/// ```rust
/// use rampart_document::{BackendError, DocumentKey, MemoryBackend};
///
/// let backend = MemoryBackend::<u32>::new();
/// let key = DocumentKey::from(42u64);
/// backend.inject_open_failures(&key, [BackendError::Service("throttled".into())]);
/// assert_eq!(backend.stats(&key).opens, 0);
/// ```
pub struct MemoryBackend<T> {
    schema_version: u32,
    latency: Duration,
    state: Mutex<MemoryState<T>>,
}

impl<T: Record + Default> MemoryBackend<T> {
    pub fn new() -> Self {
        Self {
            schema_version: DEFAULT_SCHEMA_VERSION,
            latency: Duration::ZERO,
            state: Mutex::new(MemoryState {
                records: HashMap::new(),
                locked: HashSet::new(),
                stats: HashMap::new(),
                open_faults: HashMap::new(),
                write_faults: HashMap::new(),
            }),
        }
    }

    /// Sets the newest schema version this backend can load.
    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    /// Delays every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Stores a record directly, as if another server had written it.
    pub fn insert_record(&self, key: &DocumentKey, schema_version: u32, value: T) {
        self.lock_state().records.insert(
            key.clone(),
            StoredRecord {
                schema_version,
                value,
            },
        );
    }

    /// The record currently stored for `key`.
    pub fn record(&self, key: &DocumentKey) -> Option<StoredRecord<T>> {
        self.lock_state().records.get(key).cloned()
    }

    /// Queues errors that the next opens of `key` return, in order.
    pub fn inject_open_failures(
        &self,
        key: &DocumentKey,
        failures: impl IntoIterator<Item = BackendError>,
    ) {
        self.lock_state()
            .open_faults
            .entry(key.clone())
            .or_default()
            .extend(failures);
    }

    /// Makes the next write (or release) of `key` fail with `error`.
    pub fn inject_write_failure(&self, key: &DocumentKey, error: BackendError) {
        self.lock_state().write_faults.insert(key.clone(), error);
    }

    pub fn stats(&self, key: &DocumentKey) -> KeyStats {
        self.lock_state()
            .stats
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    /// `true` while some open holds the session lock on `key`.
    pub fn is_locked(&self, key: &DocumentKey) -> bool {
        self.lock_state().locked.contains(key)
    }

    fn lock_state(&self) -> MutexGuard<'_, MemoryState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn store(&self, key: &DocumentKey, value: &T) -> Result<(), BackendError> {
        let mut state = self.lock_state();
        if let Some(err) = state.write_faults.remove(key) {
            return Err(err);
        }
        state.records.insert(
            key.clone(),
            StoredRecord {
                schema_version: self.schema_version,
                value: value.clone(),
            },
        );
        Ok(())
    }
}

impl<T: Record + Default> Default for MemoryBackend<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Record + Default> Backend<T> for MemoryBackend<T> {
    async fn open(&self, key: &DocumentKey) -> Result<OpenedRecord<T>, BackendError> {
        self.simulate_latency().await;

        let mut state = self.lock_state();
        state.stats.entry(key.clone()).or_default().opens += 1;

        if let Some(err) = state.open_faults.get_mut(key).and_then(VecDeque::pop_front) {
            return Err(err);
        }

        let opened = match state.records.get(key) {
            Some(stored) if stored.schema_version > self.schema_version => {
                return Err(BackendError::BackwardsCompatibility {
                    stored: stored.schema_version,
                    supported: self.schema_version,
                });
            }
            Some(stored) => OpenedRecord {
                value: stored.value.clone(),
                fresh: false,
            },
            None => {
                let value = T::default();
                state.records.insert(
                    key.clone(),
                    StoredRecord {
                        schema_version: self.schema_version,
                        value: value.clone(),
                    },
                );
                OpenedRecord { value, fresh: true }
            }
        };

        if !state.locked.insert(key.clone()) {
            tracing::debug!(%key, "session lock stolen from previous holder");
        }
        Ok(opened)
    }

    async fn write(&self, key: &DocumentKey, value: &T) -> Result<(), BackendError> {
        self.simulate_latency().await;
        self.lock_state().stats.entry(key.clone()).or_default().writes += 1;
        self.store(key, value)
    }

    async fn release(&self, key: &DocumentKey, value: &T) -> Result<(), BackendError> {
        self.simulate_latency().await;
        let result = self.store(key, value);

        let mut state = self.lock_state();
        state.stats.entry(key.clone()).or_default().releases += 1;
        state.locked.remove(key);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_missing_record_creates_fresh_default() {
        let backend = MemoryBackend::<u32>::new();
        let key = DocumentKey::from(42u64);

        let opened = backend.open(&key).await.unwrap();

        assert!(opened.fresh);
        assert_eq!(opened.value, 0);
        assert!(backend.is_locked(&key));
        assert_eq!(backend.record(&key).unwrap().schema_version, DEFAULT_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_open_existing_record_is_not_fresh() {
        let backend = MemoryBackend::<u32>::new();
        let key = DocumentKey::from(7u64);
        backend.insert_record(&key, 1, 99);

        let opened = backend.open(&key).await.unwrap();

        assert!(!opened.fresh);
        assert_eq!(opened.value, 99);
    }

    #[tokio::test]
    async fn test_open_newer_schema_is_backwards_compatibility_error() {
        let backend = MemoryBackend::<u32>::new().with_schema_version(2);
        let key = DocumentKey::from(7u64);
        backend.insert_record(&key, 3, 1);

        let err = backend.open(&key).await.unwrap_err();

        assert_eq!(
            err,
            BackendError::BackwardsCompatibility {
                stored: 3,
                supported: 2
            }
        );
        assert!(!backend.is_locked(&key));
    }

    #[tokio::test]
    async fn test_open_injected_faults_consumed_in_order() {
        let backend = MemoryBackend::<u32>::new();
        let key = DocumentKey::from(1u64);
        backend.inject_open_failures(
            &key,
            [
                BackendError::Service("throttled".into()),
                BackendError::Other("boom".into()),
            ],
        );

        assert!(matches!(backend.open(&key).await, Err(BackendError::Service(_))));
        assert!(matches!(backend.open(&key).await, Err(BackendError::Other(_))));
        assert!(backend.open(&key).await.is_ok());
        assert_eq!(backend.stats(&key).opens, 3);
    }

    #[tokio::test]
    async fn test_release_persists_value_and_unlocks() {
        let backend = MemoryBackend::<u32>::new();
        let key = DocumentKey::from(5u64);
        backend.open(&key).await.unwrap();

        backend.release(&key, &12).await.unwrap();

        assert!(!backend.is_locked(&key));
        assert_eq!(backend.record(&key).unwrap().value, 12);
        assert_eq!(backend.stats(&key).releases, 1);
    }

    #[tokio::test]
    async fn test_write_injected_failure_keeps_old_record() {
        let backend = MemoryBackend::<u32>::new();
        let key = DocumentKey::from(5u64);
        backend.insert_record(&key, 1, 3);
        backend.inject_write_failure(&key, BackendError::Service("down".into()));

        assert!(backend.write(&key, &4).await.is_err());
        assert_eq!(backend.record(&key).unwrap().value, 3);

        backend.write(&key, &4).await.unwrap();
        assert_eq!(backend.record(&key).unwrap().value, 4);
        assert_eq!(backend.stats(&key).writes, 2);
    }
}
