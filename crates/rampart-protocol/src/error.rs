//! Error types for the protocol layer.

/// Errors that can occur while encoding or decoding protocol values.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A value could not be serialized.
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Bytes could not be deserialized into the expected type:
    /// malformed JSON, a missing field, or an unknown message tag.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The message decoded but breaks a protocol rule, such as a
    /// handshake that is not the first message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
