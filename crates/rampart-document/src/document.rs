//! The document: one record's cache, hooks, and lifecycle.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use crate::store::StoreShared;
use crate::{Backend, DocumentError, DocumentKey, OpenedRecord, Record};

/// The mutations a hook can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentEvent {
    /// [`Document::update`] wrote a new value through to the backend.
    Update,
    /// [`Document::set_cache`] replaced the cached value.
    SetCache,
    /// [`Document::flush`] saved the cache to the backend.
    Flush,
    /// [`Document::close`] saved the cache and released the document.
    Close,
}

type Hook<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A cached, hook-observable handle to one persisted record.
///
/// `Document` is a cheap handle (`Arc` inside): clones refer to the same
/// cache and hooks. Only [`DocumentStore`](crate::DocumentStore) creates
/// documents.
///
/// ## Lifecycle
///
/// ```text
/// DocumentStore::get_document() ──→ [Open] ──close()──→ [Closed]
///                                     │ ▲
///                 update()/set_cache()└─┘ hooks fire after each mutation
/// ```
///
/// Mutations are serialized per document and follow cache-then-notify
/// ordering: the cache holds the new value before the first hook runs,
/// so a hook calling [`get_cache`](Document::get_cache) sees what it was
/// notified about.
pub struct Document<T: Record> {
    inner: Arc<DocumentInner<T>>,
}

struct DocumentInner<T: Record> {
    key: DocumentKey,
    fresh_record: bool,
    cache: RwLock<T>,
    hooks: Mutex<HashMap<DocumentEvent, Vec<Hook<T>>>>,
    /// Only flipped to `true` while the store's slot lock is held, so an
    /// `Open` slot never hands out a closed document.
    closed: AtomicBool,
    /// Serializes backend-touching operations on this document.
    writer: tokio::sync::Mutex<()>,
    backend: Arc<dyn Backend<T>>,
    store: Weak<StoreShared<T>>,
}

impl<T: Record> Clone for Document<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Record> fmt::Debug for Document<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("key", &self.inner.key)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<T: Record> Document<T> {
    pub(crate) fn new(
        key: DocumentKey,
        record: OpenedRecord<T>,
        backend: Arc<dyn Backend<T>>,
        store: Weak<StoreShared<T>>,
    ) -> Self {
        Self {
            inner: Arc::new(DocumentInner {
                key,
                fresh_record: record.fresh,
                cache: RwLock::new(record.value),
                hooks: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                writer: tokio::sync::Mutex::new(()),
                backend,
                store,
            }),
        }
    }

    /// The key of the record this document wraps.
    pub fn key(&self) -> &DocumentKey {
        &self.inner.key
    }

    /// `true` if the backend had no record and created one on open.
    pub fn is_fresh_record(&self) -> bool {
        self.inner.fresh_record
    }

    /// `true` once [`close`](Document::close) has started.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// `true` if both handles refer to the same document instance.
    pub fn same_document(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns a copy of the cached value.
    ///
    /// Never awaits and never fails. After close it returns the last
    /// value that was flushed.
    pub fn get_cache(&self) -> T {
        self.inner
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Registers `hook` to run after every successful mutation of kind
    /// `event`.
    ///
    /// Hooks for the same event run in registration order, synchronously,
    /// before the mutating call returns. They receive the new value and
    /// may also read it back through [`get_cache`](Document::get_cache).
    pub fn hook_after(
        &self,
        event: DocumentEvent,
        hook: impl Fn(&T) + Send + Sync + 'static,
    ) {
        self.inner
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event)
            .or_default()
            .push(Arc::new(hook));
    }

    /// Applies `transform` to a copy of the cache, writes the result to
    /// the backend, then caches it and runs the [`DocumentEvent::Update`]
    /// hooks. Returns the new value.
    ///
    /// # Errors
    /// - [`DocumentError::AlreadyClosed`] if the document is closed.
    /// - [`DocumentError::Backend`] if the write failed; the cache is left
    ///   unchanged and no hook runs.
    pub async fn update<F>(&self, transform: F) -> Result<T, DocumentError>
    where
        F: FnOnce(&mut T) + Send,
    {
        match self.try_update(transform).await? {
            Some(next) => Ok(next),
            None => Err(self.closed_error()),
        }
    }

    /// Like [`update`](Self::update), but a document closed concurrently
    /// is not an error: returns `Ok(None)` and leaves the value alone.
    ///
    /// For callers that may race a close in normal operation, such as
    /// game logic updating a player who is leaving.
    ///
    /// # Errors
    /// [`DocumentError::Backend`] if the write failed.
    pub async fn try_update<F>(&self, transform: F) -> Result<Option<T>, DocumentError>
    where
        F: FnOnce(&mut T) + Send,
    {
        let _writer = self.inner.writer.lock().await;
        if self.is_closed() {
            tracing::debug!(key = %self.inner.key, "update skipped, document closed");
            return Ok(None);
        }

        let mut next = self.get_cache();
        transform(&mut next);
        self.inner.backend.write(&self.inner.key, &next).await?;

        self.store_cache(next.clone());
        self.fire(DocumentEvent::Update, &next);
        Ok(Some(next))
    }

    /// Replaces the cached value without touching the backend. The value
    /// is persisted by the next flush or close.
    ///
    /// # Errors
    /// [`DocumentError::AlreadyClosed`] if the document is closed.
    pub async fn set_cache(&self, value: T) -> Result<(), DocumentError> {
        let _writer = self.inner.writer.lock().await;
        self.ensure_open()?;

        self.store_cache(value.clone());
        self.fire(DocumentEvent::SetCache, &value);
        Ok(())
    }

    /// Writes the cached value to the backend without closing.
    ///
    /// # Errors
    /// - [`DocumentError::AlreadyClosed`] if the document is closed.
    /// - [`DocumentError::Backend`] if the write failed.
    pub async fn flush(&self) -> Result<(), DocumentError> {
        let _writer = self.inner.writer.lock().await;
        self.ensure_open()?;

        let value = self.get_cache();
        self.inner.backend.write(&self.inner.key, &value).await?;
        self.fire(DocumentEvent::Flush, &value);
        Ok(())
    }

    /// Flushes the cache, releases the backend session and the store
    /// slot, and marks the document closed.
    ///
    /// The document counts as closed even if the final flush fails; the
    /// error is returned so the caller can log it. While the flush is in
    /// progress, [`DocumentStore::get_document`](crate::DocumentStore::get_document)
    /// for the same key waits, then opens a new document.
    ///
    /// # Errors
    /// - [`DocumentError::AlreadyClosed`] if the document was already closed.
    /// - [`DocumentError::Backend`] if the final flush failed.
    pub async fn close(&self) -> Result<(), DocumentError> {
        let _writer = self.inner.writer.lock().await;
        if self.is_closed() {
            return Err(DocumentError::AlreadyClosed(self.inner.key.clone()));
        }

        let store = self.inner.store.upgrade();
        match &store {
            Some(store) => store.begin_close(self),
            None => self.mark_closed(),
        }
        // Clears the Closing slot even if this future is dropped mid-flush.
        let _slot = store.map(|store| ClosingSlot {
            store,
            key: self.inner.key.clone(),
        });

        let value = self.get_cache();
        match self.inner.backend.release(&self.inner.key, &value).await {
            Ok(()) => {
                tracing::info!(key = %self.inner.key, "document closed");
                self.fire(DocumentEvent::Close, &value);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    key = %self.inner.key,
                    error = %e,
                    "document closed but final flush failed"
                );
                Err(e.into())
            }
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    fn ensure_open(&self) -> Result<(), DocumentError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        Ok(())
    }

    fn closed_error(&self) -> DocumentError {
        tracing::error!(
            key = %self.inner.key,
            "operation on a closed document"
        );
        DocumentError::AlreadyClosed(self.inner.key.clone())
    }

    fn store_cache(&self, value: T) {
        *self
            .inner
            .cache
            .write()
            .unwrap_or_else(PoisonError::into_inner) = value;
    }

    /// Runs the hooks for `event`. The hook list is copied out first so a
    /// hook may register further hooks without deadlocking.
    fn fire(&self, event: DocumentEvent, value: &T) {
        let hooks: Vec<Hook<T>> = self
            .inner
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event)
            .cloned()
            .unwrap_or_default();
        for hook in hooks {
            hook(value);
        }
    }
}

/// Drop guard that ends the store's `Closing` state for a key.
struct ClosingSlot<T: Record> {
    store: Arc<StoreShared<T>>,
    key: DocumentKey,
}

impl<T: Record> Drop for ClosingSlot<T> {
    fn drop(&mut self) {
        self.store.finish_close(&self.key);
    }
}
