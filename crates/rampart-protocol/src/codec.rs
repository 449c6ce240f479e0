//! Codec trait and implementations for turning values into bytes.
//!
//! The server uses one codec for both layers of a frame: the outer
//! [`Envelope`](crate::Envelope) and the [`PlayerData`](crate::PlayerData)
//! or [`GameInfo`](crate::GameInfo) bytes nested inside it.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// Encodes values to bytes and decodes them back.
///
/// Codecs are called from synchronous document hooks as well as from
/// async connection tasks, so encoding must not block or await.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Encode`] if the value cannot be
    /// represented in this format.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Decode`] if the bytes are malformed or do
    /// not match `T`.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] backed by `serde_json`.
///
/// ```rust
/// use rampart_protocol::{Codec, Envelope, JsonCodec, Message};
///
/// let codec = JsonCodec;
/// let envelope = Envelope::new(1, 5000, Message::RequestPlayerData);
///
/// let bytes = codec.encode(&envelope).unwrap();
/// let decoded: Envelope = codec.decode(&bytes).unwrap();
/// assert_eq!(envelope, decoded);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}

#[cfg(all(test, feature = "json"))]
mod tests {
    use super::*;
    use crate::{Envelope, Message, PlayerData};

    #[test]
    fn test_json_codec_nested_player_data_decodes() {
        // Player data is encoded once, then wrapped in an envelope that is
        // encoded again; the client peels both layers.
        let codec = JsonCodec;
        let mut data = PlayerData::default();
        data.award_coins(75);

        let inner = codec.encode(&data).unwrap();
        let frame = codec
            .encode(&Envelope::new(4, 0, Message::PlayerData { data: inner }))
            .unwrap();

        let envelope: Envelope = codec.decode(&frame).unwrap();
        let Message::PlayerData { data: bytes } = envelope.message else {
            panic!("expected PlayerData message");
        };
        let decoded: PlayerData = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.coins, 75);
    }

    #[test]
    fn test_json_codec_decode_garbage_is_decode_error() {
        let result: Result<Envelope, _> = JsonCodec.decode(b"not json at all");
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }
}
