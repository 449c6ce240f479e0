//! Integration tests for the document store over the in-memory backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rampart_document::{
    BackendError, DocumentError, DocumentEvent, DocumentKey, DocumentStore, MemoryBackend,
};

#[derive(Debug, Clone, Default, PartialEq)]
struct Wallet {
    coins: u64,
}

const LATENCY: Duration = Duration::from_millis(50);

fn store() -> (Arc<MemoryBackend<Wallet>>, DocumentStore<Wallet>) {
    let backend = Arc::new(MemoryBackend::new());
    let store = DocumentStore::new(Arc::clone(&backend));
    (backend, store)
}

fn slow_store() -> (Arc<MemoryBackend<Wallet>>, DocumentStore<Wallet>) {
    let backend = Arc::new(MemoryBackend::new().with_latency(LATENCY));
    let store = DocumentStore::new(Arc::clone(&backend));
    (backend, store)
}

/// Lets spawned tasks run up to their next suspension point.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

// =========================================================================
// Opening
// =========================================================================

#[tokio::test]
async fn test_get_document_unknown_player_creates_fresh_record() {
    let (backend, store) = store();
    let key = DocumentKey::from(42u64);

    let (document, created) = store.get_document(&key).await.unwrap();

    assert!(created);
    assert!(document.is_fresh_record());
    assert_eq!(document.key().as_str(), "42");
    assert_eq!(document.get_cache(), Wallet::default());
    assert!(backend.record(&key).is_some());
    assert!(backend.is_locked(&key));
}

#[tokio::test]
async fn test_get_document_existing_record_is_not_fresh() {
    let (backend, store) = store();
    let key = DocumentKey::from(7u64);
    backend.insert_record(&key, 1, Wallet { coins: 40 });

    let (document, created) = store.get_document(&key).await.unwrap();

    assert!(created);
    assert!(!document.is_fresh_record());
    assert_eq!(document.get_cache().coins, 40);
}

#[tokio::test]
async fn test_get_document_already_open_returns_same_document() {
    let (backend, store) = store();
    let key = DocumentKey::from(1u64);

    let (first, _) = store.get_document(&key).await.unwrap();
    let (second, created) = store.get_document(&key).await.unwrap();

    assert!(!created);
    assert!(first.same_document(&second));
    assert_eq!(backend.stats(&key).opens, 1);
    assert_eq!(store.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_get_document_concurrent_callers_share_one_open() {
    let (backend, store) = slow_store();
    let key = DocumentKey::from(42u64);

    let (a, b, c) = tokio::join!(
        store.get_document(&key),
        store.get_document(&key),
        store.get_document(&key),
    );
    let (a, created_a) = a.unwrap();
    let (b, created_b) = b.unwrap();
    let (c, created_c) = c.unwrap();

    assert_eq!([created_a, created_b, created_c], [true, false, false]);
    assert!(a.same_document(&b));
    assert!(a.same_document(&c));
    assert_eq!(backend.stats(&key).opens, 1);
}

#[tokio::test(start_paused = true)]
async fn test_get_document_open_failure_reaches_every_waiter() {
    let (backend, store) = slow_store();
    let key = DocumentKey::from(3u64);
    backend.inject_open_failures(&key, [BackendError::Service("throttled".into())]);

    let (a, b) = tokio::join!(store.get_document(&key), store.get_document(&key));

    let expected = DocumentError::Backend(BackendError::Service("throttled".into()));
    assert_eq!(a.unwrap_err(), expected);
    assert_eq!(b.unwrap_err(), expected);
    assert_eq!(backend.stats(&key).opens, 1);

    // The failed slot is cleared, so the next call opens again.
    let (_, created) = store.get_document(&key).await.unwrap();
    assert!(created);
}

#[tokio::test]
async fn test_get_document_newer_schema_is_backwards_compatibility_error() {
    let (backend, store) = store();
    let key = DocumentKey::from(9u64);
    backend.insert_record(&key, 2, Wallet { coins: 1 });

    let err = store.get_document(&key).await.unwrap_err();

    assert!(matches!(
        err,
        DocumentError::Backend(BackendError::BackwardsCompatibility { stored: 2, supported: 1 })
    ));
    assert!(!store.is_open(&key));
}

#[tokio::test(start_paused = true)]
async fn test_get_document_owner_dropped_waiters_get_open_abandoned() {
    let (_backend, store) = slow_store();
    let key = DocumentKey::from(5u64);

    let owner = tokio::spawn({
        let store = store.clone();
        let key = key.clone();
        async move { store.get_document(&key).await }
    });
    settle().await;
    let waiter = tokio::spawn({
        let store = store.clone();
        let key = key.clone();
        async move { store.get_document(&key).await }
    });
    settle().await;

    owner.abort();
    let result = waiter.await.unwrap();

    assert_eq!(result.unwrap_err(), DocumentError::OpenAbandoned(key.clone()));
    assert!(!store.is_open(&key));
}

// =========================================================================
// Mutations and hooks
// =========================================================================

#[tokio::test]
async fn test_update_hooks_see_new_value_in_cache() {
    let (_backend, store) = store();
    let (document, _) = store.get_document(&DocumentKey::from(1u64)).await.unwrap();

    // Each entry is (value passed to the hook, value read back from the cache).
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        let reader = document.clone();
        document.hook_after(DocumentEvent::Update, move |wallet| {
            let cached = reader.get_cache();
            seen.lock().unwrap().push((wallet.coins, cached.coins));
        });
    }

    for _ in 0..3 {
        document.update(|wallet| wallet.coins += 10).await.unwrap();
    }

    assert_eq!(*seen.lock().unwrap(), vec![(10, 10), (20, 20), (30, 30)]);
}

#[tokio::test]
async fn test_hook_after_runs_in_registration_order() {
    let (_backend, store) = store();
    let (document, _) = store.get_document(&DocumentKey::from(1u64)).await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    for name in ["first", "second", "third"] {
        let order = Arc::clone(&order);
        document.hook_after(DocumentEvent::Update, move |_| {
            order.lock().unwrap().push(name);
        });
    }

    document.update(|wallet| wallet.coins = 1).await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_update_backend_failure_leaves_cache_and_skips_hooks() {
    let (backend, store) = store();
    let key = DocumentKey::from(1u64);
    let (document, _) = store.get_document(&key).await.unwrap();
    document.update(|wallet| wallet.coins = 5).await.unwrap();

    let fired = Arc::new(Mutex::new(0));
    {
        let fired = Arc::clone(&fired);
        document.hook_after(DocumentEvent::Update, move |_| {
            *fired.lock().unwrap() += 1;
        });
    }
    backend.inject_write_failure(&key, BackendError::Service("down".into()));

    let result = document.update(|wallet| wallet.coins = 500).await;

    assert!(matches!(result, Err(DocumentError::Backend(_))));
    assert_eq!(document.get_cache().coins, 5);
    assert_eq!(*fired.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_set_cache_is_persisted_on_close() {
    let (backend, store) = store();
    let key = DocumentKey::from(1u64);
    let (document, _) = store.get_document(&key).await.unwrap();

    let fired = Arc::new(Mutex::new(Vec::new()));
    {
        let fired = Arc::clone(&fired);
        document.hook_after(DocumentEvent::SetCache, move |wallet| {
            fired.lock().unwrap().push(wallet.coins);
        });
    }

    document.set_cache(Wallet { coins: 77 }).await.unwrap();
    assert_eq!(backend.stats(&key).writes, 0);
    assert_eq!(*fired.lock().unwrap(), vec![77]);

    document.close().await.unwrap();
    assert_eq!(backend.record(&key).unwrap().value.coins, 77);
}

// =========================================================================
// Closing
// =========================================================================

#[tokio::test]
async fn test_close_then_mutation_is_already_closed() {
    let (backend, store) = store();
    let key = DocumentKey::from(1u64);
    let (document, _) = store.get_document(&key).await.unwrap();
    document.update(|wallet| wallet.coins = 3).await.unwrap();

    document.close().await.unwrap();

    assert!(document.is_closed());
    assert!(!backend.is_locked(&key));
    let closed = DocumentError::AlreadyClosed(key.clone());
    assert_eq!(document.update(|wallet| wallet.coins = 4).await.unwrap_err(), closed);
    assert_eq!(document.set_cache(Wallet::default()).await.unwrap_err(), closed);
    assert_eq!(document.flush().await.unwrap_err(), closed);
    assert_eq!(document.close().await.unwrap_err(), closed);
    // Still readable.
    assert_eq!(document.get_cache().coins, 3);
    assert_eq!(backend.stats(&key).releases, 1);
}

#[tokio::test]
async fn test_try_update_after_close_is_skipped() {
    let (backend, store) = store();
    let key = DocumentKey::from(1u64);
    let (document, _) = store.get_document(&key).await.unwrap();
    document.update(|wallet| wallet.coins = 3).await.unwrap();
    let updates = Arc::new(Mutex::new(0));
    let seen = Arc::clone(&updates);
    document.hook_after(DocumentEvent::Update, move |_| *seen.lock().unwrap() += 1);
    document.close().await.unwrap();
    let writes = backend.stats(&key).writes;

    let result = document.try_update(|wallet| wallet.coins = 9).await;

    assert_eq!(result, Ok(None));
    assert_eq!(document.get_cache().coins, 3);
    assert_eq!(backend.stats(&key).writes, writes);
    assert_eq!(*updates.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_try_update_open_document_returns_new_value() {
    let (_backend, store) = store();
    let (document, _) = store.get_document(&DocumentKey::from(1u64)).await.unwrap();

    let result = document.try_update(|wallet| wallet.coins += 5).await;

    assert_eq!(result, Ok(Some(Wallet { coins: 5 })));
    assert_eq!(document.get_cache().coins, 5);
}

#[tokio::test]
async fn test_close_runs_close_hooks_with_final_value() {
    let (_backend, store) = store();
    let (document, _) = store.get_document(&DocumentKey::from(1u64)).await.unwrap();
    document.set_cache(Wallet { coins: 8 }).await.unwrap();

    let closed_with = Arc::new(Mutex::new(None));
    {
        let closed_with = Arc::clone(&closed_with);
        document.hook_after(DocumentEvent::Close, move |wallet| {
            *closed_with.lock().unwrap() = Some(wallet.coins);
        });
    }

    document.close().await.unwrap();

    assert_eq!(*closed_with.lock().unwrap(), Some(8));
}

#[tokio::test]
async fn test_get_document_after_close_opens_new_document() {
    let (backend, store) = store();
    let key = DocumentKey::from(42u64);
    let (old, _) = store.get_document(&key).await.unwrap();
    old.update(|wallet| wallet.coins = 12).await.unwrap();
    old.close().await.unwrap();

    let (new, created) = store.get_document(&key).await.unwrap();

    assert!(created);
    assert!(!new.same_document(&old));
    assert!(!new.is_fresh_record());
    assert_eq!(new.get_cache().coins, 12);
    assert_eq!(backend.stats(&key).opens, 2);
    assert_eq!(backend.stats(&key).releases, 1);
}

#[tokio::test(start_paused = true)]
async fn test_get_document_during_close_waits_for_final_flush() {
    let (_backend, store) = slow_store();
    let key = DocumentKey::from(6u64);
    let (old, _) = store.get_document(&key).await.unwrap();
    // Only in the cache; reaches the backend with the close.
    old.set_cache(Wallet { coins: 99 }).await.unwrap();

    let closing = tokio::spawn({
        let old = old.clone();
        async move { old.close().await }
    });
    settle().await;
    assert!(!store.is_open(&key));

    let (new, created) = store.get_document(&key).await.unwrap();

    assert!(created);
    assert_eq!(new.get_cache().coins, 99);
    closing.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_close_all_documents_twice_releases_each_key_once() {
    let (backend, store) = store();
    let keys: Vec<DocumentKey> = (1..=3u64).map(DocumentKey::from).collect();
    for key in &keys {
        store.get_document(key).await.unwrap();
    }

    assert_eq!(store.close_all_documents().await, 3);
    assert_eq!(store.close_all_documents().await, 0);

    for key in &keys {
        assert_eq!(backend.stats(key).releases, 1);
        assert!(!backend.is_locked(key));
    }
    assert_eq!(store.open_count(), 0);
    assert!(store.is_shut_down());
}

#[tokio::test]
async fn test_get_document_after_shutdown_is_store_closed() {
    let (backend, store) = store();
    store.close_all_documents().await;

    let key = DocumentKey::from(1u64);
    let err = store.get_document(&key).await.unwrap_err();

    assert_eq!(err, DocumentError::StoreClosed);
    assert_eq!(backend.stats(&key).opens, 0);
}

#[tokio::test(start_paused = true)]
async fn test_open_settling_after_shutdown_is_released() {
    let (backend, store) = slow_store();
    let key = DocumentKey::from(4u64);

    let opening = tokio::spawn({
        let store = store.clone();
        let key = key.clone();
        async move { store.get_document(&key).await }
    });
    settle().await;

    assert_eq!(store.close_all_documents().await, 0);
    let result = opening.await.unwrap();

    assert_eq!(result.unwrap_err(), DocumentError::StoreClosed);
    assert_eq!(backend.stats(&key).releases, 1);
    assert!(!backend.is_locked(&key));
}

// =========================================================================
// Autosave
// =========================================================================

#[tokio::test]
async fn test_flush_all_writes_every_open_cache() {
    let (backend, store) = store();
    let a = DocumentKey::from(1u64);
    let b = DocumentKey::from(2u64);
    let (doc_a, _) = store.get_document(&a).await.unwrap();
    let (doc_b, _) = store.get_document(&b).await.unwrap();
    doc_a.set_cache(Wallet { coins: 1 }).await.unwrap();
    doc_b.set_cache(Wallet { coins: 2 }).await.unwrap();

    assert_eq!(store.flush_all().await, 2);

    assert_eq!(backend.record(&a).unwrap().value.coins, 1);
    assert_eq!(backend.record(&b).unwrap().value.coins, 2);
    assert!(!doc_a.is_closed());
}

#[tokio::test]
async fn test_flush_all_skips_failed_writes() {
    let (backend, store) = store();
    let a = DocumentKey::from(1u64);
    let b = DocumentKey::from(2u64);
    store.get_document(&a).await.unwrap();
    store.get_document(&b).await.unwrap();
    backend.inject_write_failure(&b, BackendError::Other("disk".into()));

    assert_eq!(store.flush_all().await, 1);
}
