//! Player documents for Rampart.
//!
//! A [`Document`] is the in-memory copy of one persisted record plus the
//! hooks that fire when it changes. The [`DocumentStore`] is the only
//! thing that opens or releases documents, and it guarantees there is at
//! most one open document per [`DocumentKey`], even when several tasks ask
//! for the same key at once.
//!
//! ```text
//! Session Layer (above)   ← opens a document per connected player
//!     ↕
//! Document Layer (this crate)   ← cache, hooks, open/close lifecycle
//!     ↕
//! Backend (below)   ← remote record store; slow, rate-limited, may fail
//! ```
//!
//! The backend is abstracted by the [`Backend`] trait. [`MemoryBackend`]
//! is an in-process implementation with fault injection, used by the demo
//! server and the tests.

mod backend;
mod document;
mod error;
mod key;
mod memory;
mod store;

pub use backend::{Backend, OpenedRecord, Record};
pub use document::{Document, DocumentEvent};
pub use error::{BackendError, DocumentError};
pub use key::DocumentKey;
pub use memory::{DEFAULT_SCHEMA_VERSION, KeyStats, MemoryBackend, StoredRecord};
pub use store::DocumentStore;
