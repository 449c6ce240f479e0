//! Wire protocol for Rampart.
//!
//! - **Types** ([`Envelope`], [`Message`], [`PlayerId`]) — the frames
//!   exchanged with game clients.
//! - **Data** ([`PlayerData`], [`GameInfo`]) — the payloads those frames
//!   carry: a player's persisted record and the match snapshot.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]) — how values become bytes.
//! - **Errors** ([`ProtocolError`]).
//!
//! ```text
//! Transport (bytes) → Protocol (Envelope) → Session (player data)
//! ```

mod codec;
mod data;
mod error;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use data::{GameInfo, PlayerData, TilePosition, TowerInfo};
pub use error::ProtocolError;
pub use types::{Envelope, Message, PROTOCOL_VERSION, PlayerId};
