//! # Rampart
//!
//! Server side of a tower-defense game: every connected player's saved
//! data is opened from a persistence backend, kept in sync with their
//! client, and saved back when they leave or the server stops. Match
//! snapshots ([`GameInfo`](rampart_protocol::GameInfo)) are broadcast to
//! everyone.
//!
//! The layers, leaf-first:
//!
//! | Crate | Does |
//! |---|---|
//! | `rampart-transport` | WebSocket connections |
//! | `rampart-protocol` | Wire messages, payloads, codecs |
//! | `rampart-document` | Cached documents over a `Backend` |
//! | `rampart-retry` | Backoff for opening documents |
//! | `rampart-session` | One document per connected player |
//! | `rampart` (this crate) | Accept loop, connection tasks, shutdown, autosave |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rampart::prelude::*;
//!
//! # async fn run() -> Result<(), RampartError> {
//! rampart::init_tracing();
//!
//! let backend = Arc::new(MemoryBackend::<PlayerData>::new());
//! let server = RampartServerBuilder::new()
//!     .bind("0.0.0.0:8080")
//!     .build(backend, NumericTokenAuthenticator)
//!     .await?;
//! server.run().await
//! # }
//! ```

mod error;
mod handler;
mod server;

pub use error::RampartError;
pub use server::{RampartServer, RampartServerBuilder, ServerHandle};

pub use rampart_document as document;
pub use rampart_protocol as protocol;
pub use rampart_retry as retry;
pub use rampart_session as session;
pub use rampart_transport as transport;

/// The types most servers need.
pub mod prelude {
    pub use crate::{RampartError, RampartServer, RampartServerBuilder, ServerHandle};
    pub use rampart_document::{Backend, BackendError, DocumentKey, MemoryBackend, OpenedRecord};
    pub use rampart_protocol::{GameInfo, PlayerData, PlayerId, TilePosition, TowerInfo};
    pub use rampart_retry::RetryConfig;
    pub use rampart_session::{Authenticator, NumericTokenAuthenticator, SessionConfig, SessionError};
}

/// Installs a `tracing` subscriber that prints to stderr.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. Calling it
/// more than once is harmless: later calls leave the first subscriber in
/// place.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}
