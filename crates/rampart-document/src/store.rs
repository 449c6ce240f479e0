//! The document store: opens, deduplicates, and releases documents.
//!
//! # Slot state machine
//!
//! Every key the store knows about is in exactly one slot state:
//!
//! ```text
//!   (absent) ──get_document()──→ Opening ──open ok──→ Open
//!       ▲                           │                  │
//!       └────────open failed────────┘            close()
//!       ▲                                              ▼
//!       └──────────────flush finished──────────── Closing
//! ```
//!
//! Callers arriving at `Opening` queue a oneshot and receive the same
//! document as the caller that started the open. Callers arriving at
//! `Closing` wait for the flush to finish and then start a fresh open, so
//! a new session never reads the record before the old one's final write.
//!
//! The slot map is behind a `std::sync::Mutex` that is never held across
//! an `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio::task::JoinSet;

use crate::{Backend, Document, DocumentError, DocumentKey, Record};

type OpenWaiter<T> = oneshot::Sender<Result<Document<T>, DocumentError>>;

enum Slot<T: Record> {
    Opening(Vec<OpenWaiter<T>>),
    Open(Document<T>),
    Closing(Vec<oneshot::Sender<()>>),
}

/// State shared between the store and the documents it hands out.
pub(crate) struct StoreShared<T: Record> {
    backend: Arc<dyn Backend<T>>,
    slots: Mutex<HashMap<DocumentKey, Slot<T>>>,
    shut_down: AtomicBool,
}

impl<T: Record> StoreShared<T> {
    fn lock_slots(&self) -> MutexGuard<'_, HashMap<DocumentKey, Slot<T>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves `document`'s slot from `Open` to `Closing` and marks the
    /// document closed, atomically with respect to `get_document`.
    pub(crate) fn begin_close(&self, document: &Document<T>) {
        let mut slots = self.lock_slots();
        let owns_slot = matches!(
            slots.get(document.key()),
            Some(Slot::Open(open)) if open.same_document(document)
        );
        if owns_slot {
            slots.insert(document.key().clone(), Slot::Closing(Vec::new()));
        }
        document.mark_closed();
    }

    /// Removes a `Closing` slot and wakes everyone waiting on it.
    pub(crate) fn finish_close(&self, key: &DocumentKey) {
        let mut slots = self.lock_slots();
        if !matches!(slots.get(key), Some(Slot::Closing(_))) {
            return;
        }
        if let Some(Slot::Closing(waiters)) = slots.remove(key) {
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
    }
}

/// What `get_document` found when it looked at a key's slot.
enum Pending<T: Record> {
    /// Nobody is opening this key; the caller must open it.
    Owner,
    /// Another caller is opening it; wait for their result.
    Opening(oneshot::Receiver<Result<Document<T>, DocumentError>>),
    /// The previous document is flushing; wait, then look again.
    Closing(oneshot::Receiver<()>),
}

/// How an owned open ended, decided under the slot lock.
enum Settled<T: Record> {
    Opened(Vec<OpenWaiter<T>>, Document<T>),
    Failed(Vec<OpenWaiter<T>>, DocumentError),
    AfterShutdown(Vec<OpenWaiter<T>>, Document<T>),
}

/// Keyed registry of open documents.
///
/// Created empty; torn down by [`close_all_documents`](Self::close_all_documents).
/// Cheap to clone: clones share the same registry.
pub struct DocumentStore<T: Record> {
    shared: Arc<StoreShared<T>>,
}

impl<T: Record> Clone for DocumentStore<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Record> DocumentStore<T> {
    /// Creates an empty store over `backend`.
    pub fn new<B: Backend<T>>(backend: Arc<B>) -> Self {
        let backend: Arc<dyn Backend<T>> = backend;
        Self {
            shared: Arc::new(StoreShared {
                backend,
                slots: Mutex::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the open document for `key`, opening it if needed.
    ///
    /// The `bool` is `true` when this call opened the document and `false`
    /// when it was already open (or being opened by another caller, in
    /// which case this call waits for that open and shares its result).
    /// Only one backend `open` runs per key at a time.
    ///
    /// # Errors
    /// - [`DocumentError::Backend`] if the backend open failed.
    /// - [`DocumentError::StoreClosed`] after [`close_all_documents`](Self::close_all_documents).
    /// - [`DocumentError::OpenAbandoned`] if the caller performing the open
    ///   was dropped before it finished.
    pub async fn get_document(
        &self,
        key: &DocumentKey,
    ) -> Result<(Document<T>, bool), DocumentError> {
        loop {
            let pending = {
                let mut slots = self.shared.lock_slots();
                if self.shared.shut_down.load(Ordering::Acquire) {
                    return Err(DocumentError::StoreClosed);
                }
                match slots.get_mut(key) {
                    Some(Slot::Open(document)) => {
                        return Ok((document.clone(), false));
                    }
                    Some(Slot::Opening(waiters)) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Pending::Opening(rx)
                    }
                    Some(Slot::Closing(waiters)) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Pending::Closing(rx)
                    }
                    None => {
                        slots.insert(key.clone(), Slot::Opening(Vec::new()));
                        Pending::Owner
                    }
                }
            };

            match pending {
                Pending::Owner => return self.open_owned(key).await,
                Pending::Opening(rx) => {
                    tracing::debug!(%key, "waiting on in-flight open");
                    return match rx.await {
                        Ok(result) => result.map(|document| (document, false)),
                        Err(_) => Err(DocumentError::OpenAbandoned(key.clone())),
                    };
                }
                Pending::Closing(rx) => {
                    tracing::debug!(%key, "waiting for previous document to close");
                    let _ = rx.await;
                }
            }
        }
    }

    /// Performs the backend open for a key whose slot this call set to
    /// `Opening`, then settles every waiter.
    async fn open_owned(
        &self,
        key: &DocumentKey,
    ) -> Result<(Document<T>, bool), DocumentError> {
        let mut in_flight = InFlightOpen {
            shared: &self.shared,
            key,
            settled: false,
        };
        let result = self.shared.backend.open(key).await;
        in_flight.settled = true;

        // Settle the slot in one critical section so no other caller can
        // slip in and start a second open for this key.
        let settled = {
            let mut slots = self.shared.lock_slots();
            let waiters = match slots.remove(key) {
                Some(Slot::Opening(waiters)) => waiters,
                _ => Vec::new(),
            };
            match result {
                Err(e) => Settled::Failed(waiters, DocumentError::from(e)),
                Ok(record) => {
                    let document = Document::new(
                        key.clone(),
                        record,
                        Arc::clone(&self.shared.backend),
                        Arc::downgrade(&self.shared),
                    );
                    if self.shared.shut_down.load(Ordering::Acquire) {
                        Settled::AfterShutdown(waiters, document)
                    } else {
                        slots.insert(key.clone(), Slot::Open(document.clone()));
                        Settled::Opened(waiters, document)
                    }
                }
            }
        };

        match settled {
            Settled::Opened(waiters, document) => {
                for waiter in waiters {
                    let _ = waiter.send(Ok(document.clone()));
                }
                tracing::info!(
                    %key,
                    fresh = document.is_fresh_record(),
                    "document opened"
                );
                Ok((document, true))
            }
            Settled::Failed(waiters, err) => {
                tracing::warn!(%key, error = %err, "document open failed");
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
                Err(err)
            }
            Settled::AfterShutdown(waiters, document) => {
                // Give the session lock straight back.
                for waiter in waiters {
                    let _ = waiter.send(Err(DocumentError::StoreClosed));
                }
                if let Err(e) = document.close().await {
                    tracing::warn!(%key, error = %e, "late open could not be released");
                }
                Err(DocumentError::StoreClosed)
            }
        }
    }

    /// Returns the open document for `key` without opening anything.
    pub fn get_open(&self, key: &DocumentKey) -> Option<Document<T>> {
        match self.shared.lock_slots().get(key) {
            Some(Slot::Open(document)) => Some(document.clone()),
            _ => None,
        }
    }

    /// `true` if `key` currently has an open document.
    pub fn is_open(&self, key: &DocumentKey) -> bool {
        self.get_open(key).is_some()
    }

    /// Number of open documents.
    pub fn open_count(&self) -> usize {
        self.shared
            .lock_slots()
            .values()
            .filter(|slot| matches!(slot, Slot::Open(_)))
            .count()
    }

    /// `true` once [`close_all_documents`](Self::close_all_documents) has run.
    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }

    /// Writes every open document's cache to the backend without closing
    /// anything. Returns how many flushes succeeded.
    pub async fn flush_all(&self) -> usize {
        let mut flushed = 0;
        for document in self.open_documents() {
            match document.flush().await {
                Ok(()) => flushed += 1,
                // closed between the snapshot and the flush
                Err(DocumentError::AlreadyClosed(_)) => {}
                Err(e) => {
                    tracing::warn!(key = %document.key(), error = %e, "autosave failed");
                }
            }
        }
        flushed
    }

    /// Closes every open document and stops accepting new opens.
    ///
    /// This is the last-resort save path at process shutdown. Documents
    /// are flushed concurrently, in no particular order. Calling it again
    /// is a no-op: already-closed documents are not flushed twice.
    /// Returns how many documents this call closed.
    pub async fn close_all_documents(&self) -> usize {
        let documents = {
            let slots = self.shared.lock_slots();
            self.shared.shut_down.store(true, Ordering::Release);
            slots
                .values()
                .filter_map(|slot| match slot {
                    Slot::Open(document) => Some(document.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
        };

        let mut closing = JoinSet::new();
        for document in documents {
            closing.spawn(async move {
                let key = document.key().clone();
                (key, document.close().await)
            });
        }

        let mut closed = 0;
        while let Some(joined) = closing.join_next().await {
            match joined {
                Ok((_, Ok(()))) => closed += 1,
                Ok((_, Err(DocumentError::AlreadyClosed(_)))) => {}
                Ok((key, Err(e))) => {
                    // Closed, but the final flush was lost.
                    closed += 1;
                    tracing::error!(%key, error = %e, "flush on shutdown failed");
                }
                Err(e) => {
                    tracing::error!(error = %e, "document close task failed");
                }
            }
        }

        tracing::info!(closed, "all documents closed");
        closed
    }

    fn open_documents(&self) -> Vec<Document<T>> {
        self.shared
            .lock_slots()
            .values()
            .filter_map(|slot| match slot {
                Slot::Open(document) => Some(document.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Drop guard for an open this store is performing.
///
/// If the owning future is dropped before the backend answers, the
/// `Opening` slot is removed; dropping its senders wakes the waiters
/// with [`DocumentError::OpenAbandoned`].
struct InFlightOpen<'a, T: Record> {
    shared: &'a StoreShared<T>,
    key: &'a DocumentKey,
    settled: bool,
}

impl<T: Record> Drop for InFlightOpen<'_, T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut slots = self.shared.lock_slots();
        if matches!(slots.get(self.key), Some(Slot::Opening(_))) {
            slots.remove(self.key);
            tracing::warn!(key = %self.key, "in-flight open abandoned");
        }
    }
}
