//! Error types for the session layer.

use rampart_document::DocumentError;
use rampart_protocol::{PlayerId, ProtocolError};

/// Errors that can occur during session management.
///
/// Failing to *load* a player's data is not an error here: `connect`
/// reports it as an outcome, because the player has already been told
/// and disconnected by the time it returns.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Authentication failed — the token was invalid or rejected by the
    /// [`Authenticator`](crate::Authenticator).
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The player already has a session (connecting or open).
    /// A player can only have one session at a time.
    #[error("player {0} already has an active session")]
    AlreadyConnected(PlayerId),

    /// No session exists for the given player.
    #[error("session not found for player {0}")]
    NotFound(PlayerId),

    /// `setup` was called twice on the same manager.
    #[error("player data sessions are already set up")]
    DuplicateSetup,

    /// A document operation failed after the session was open.
    #[error(transparent)]
    Document(#[from] DocumentError),

    /// The player's data could not be encoded for the client.
    #[error("failed to encode player data: {0}")]
    Encode(#[from] ProtocolError),
}
