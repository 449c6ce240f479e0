//! Unified error type for Rampart.

use rampart_protocol::ProtocolError;
use rampart_session::SessionError;
use rampart_transport::TransportError;

/// Top-level error that wraps the sub-crate errors the server propagates.
///
/// When using the `rampart` crate, you deal with this single error type
/// instead of importing errors from each sub-crate. The `#[from]`
/// attribute on each variant lets `?` convert sub-crate errors.
#[derive(Debug, thiserror::Error)]
pub enum RampartError {
    /// A transport-level error (bind, connection, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, invalid message).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session-level error (auth, duplicate connect, setup). Document
    /// failures surface here as [`SessionError::Document`].
    #[error(transparent)]
    Session(#[from] SessionError),
}
