//! Player-data sessions for Rampart.
//!
//! This crate links each connected player to their persisted data:
//!
//! 1. **Authentication**: who a player is ([`Authenticator`] trait)
//! 2. **Session tracking**: whose document is open ([`PlayerDataSessions`])
//! 3. **Synchronization**: pushing data to the client on every change and
//!    on request, and telling the player why when it cannot be loaded
//!
//! # How it fits in the stack
//!
//! ```text
//! Server Layer (above)   ← one connection task per player, calls connect/refresh/disconnect
//!     ↕
//! Session Layer (this crate)   ← registry of players and their documents
//!     ↕
//! Retry + Document Layers (below)   ← retried opens, cache, hooks, backend
//! ```

mod auth;
mod error;
mod manager;
mod messages;
mod session;

pub use auth::{Authenticator, NumericTokenAuthenticator};
pub use error::SessionError;
pub use manager::{ConnectOutcome, DisconnectOutcome, PlayerDataSessions, RefreshOutcome};
pub use messages::{
    BACKEND_SERVICE_MESSAGE, BACKWARDS_COMPATIBILITY_MESSAGE, MISSING_DOCUMENT_MESSAGE,
    SHUTTING_DOWN_MESSAGE,
    disconnect_message,
};
pub use session::{PlayerSender, SessionConfig, SessionOutbound, SessionState, SessionTicket};
