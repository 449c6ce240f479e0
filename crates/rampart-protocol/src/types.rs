//! Message types that travel between a Rampart server and its clients.
//!
//! Everything here is serialized to bytes by a [`Codec`](crate::Codec),
//! sent over the transport, and decoded on the other side. The payload
//! types the messages carry ([`PlayerData`](crate::PlayerData),
//! [`GameInfo`](crate::GameInfo)) live in `data.rs`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The protocol version clients must announce in their handshake.
pub const PROTOCOL_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// A stable identifier for a player.
///
/// This is the numeric id the player logs in with. It outlives any single
/// connection: the same player reconnecting gets the same `PlayerId`, and
/// their persisted record is keyed by it.
///
/// `#[serde(transparent)]` keeps it a plain number on the wire, so
/// `PlayerId(42)` is `42` in JSON (and `"42"` when used as a map key).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct PlayerId(pub u64);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Every message either side can send.
///
/// `#[serde(tag = "type")]` produces internally tagged JSON:
///   `{ "type": "Heartbeat", "client_time": 5000 }`
/// which is what the game client switches on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    // -- Connection lifecycle --

    /// Client → Server: first message on every connection.
    /// `token` identifies the player to the server's authenticator.
    Handshake {
        version: u32,
        token: Option<String>,
    },

    /// Server → Client: the handshake was accepted.
    HandshakeAck {
        player_id: PlayerId,
        server_time: u64,
    },

    /// Either direction: the connection is ending.
    ///
    /// Sent by the server before it drops a player whose data could not
    /// be loaded; `reason` is the message shown to the player.
    Disconnect { reason: String },

    // -- Heartbeat --

    /// Client → Server: keep-alive.
    Heartbeat { client_time: u64 },

    /// Server → Client: keep-alive reply with both clocks.
    HeartbeatAck {
        client_time: u64,
        server_time: u64,
    },

    // -- Player data --

    /// Client → Server: "send me my current player data".
    ///
    /// Clients send this once their UI is mounted, and again whenever
    /// they want to resynchronize.
    RequestPlayerData,

    /// Server → Client: the player's current data.
    ///
    /// Pushed in reply to [`Message::RequestPlayerData`] and after every
    /// update to the player's document. `data` is a
    /// [`PlayerData`](crate::PlayerData) encoded with the server's codec.
    PlayerData { data: Vec<u8> },

    // -- Match state --

    /// Server → Client: wave/economy snapshot for the whole match.
    /// `data` is a [`GameInfo`](crate::GameInfo) encoded with the codec.
    GameInfo { data: Vec<u8> },

    // -- Errors --

    /// Server → Client: a request was rejected.
    /// `code` follows HTTP conventions (400, 401, 409, ...).
    Error { code: u16, message: String },
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The top-level wire frame. Every message is sent inside one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Per-sender sequence number, starting at 0 for the handshake.
    pub seq: u64,

    /// Milliseconds since the sender's connection started.
    pub timestamp: u64,

    /// The message itself.
    pub message: Message,
}

impl Envelope {
    /// Wraps a message in an envelope.
    pub fn new(seq: u64, timestamp: u64, message: Message) -> Self {
        Self {
            seq,
            timestamp,
            message,
        }
    }
}
