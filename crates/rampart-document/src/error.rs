//! Error types for the document layer.

use crate::DocumentKey;

/// A failure reported by the persistence backend.
///
/// This is the raw backend taxonomy. Deciding what to *do* about each
/// kind (retry, give up, tell the player) happens one layer up, in the
/// open-retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The stored record was written by a schema this server does not
    /// understand. Retrying cannot help.
    #[error(
        "stored schema version {stored} is newer than supported version {supported}"
    )]
    BackwardsCompatibility { stored: u32, supported: u32 },

    /// The backend service itself failed: throttling, timeouts, outages.
    #[error("backend service error: {0}")]
    Service(String),

    /// Anything the backend could not classify.
    #[error("backend error: {0}")]
    Other(String),
}

/// Errors returned by [`Document`](crate::Document) and
/// [`DocumentStore`](crate::DocumentStore) operations.
///
/// `Clone` so that every task waiting on the same in-flight open receives
/// the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    /// The document was already closed. Indicates a caller holding on to
    /// a document past its session; never a player-facing condition.
    #[error("document {0} is already closed")]
    AlreadyClosed(DocumentKey),

    /// The backend call behind this operation failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The store has been shut down and accepts no new opens.
    #[error("document store is shut down")]
    StoreClosed,

    /// The task performing an open was dropped before the open settled.
    #[error("open of document {0} was abandoned")]
    OpenAbandoned(DocumentKey),
}
