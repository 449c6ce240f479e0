//! Session types: one connected player's link to their document.
//!
//! A "session" is the server's record of a player whose data is being
//! synchronized. It tracks:
//! - WHO the player is (`PlayerId`)
//! - WHAT state the link is in (connecting, open, closed, disconnected)
//! - WHERE to push their data (the connection's outbound channel)
//! - WHICH document holds their record, once it has been opened

use std::fmt;

use rampart_document::{Document, Record};
use rampart_protocol::PlayerId;
use rampart_retry::RetryConfig;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Configuration for player-data sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Backoff for opening a player's document on connect.
    pub retry: RetryConfig,
}

// ---------------------------------------------------------------------------
// SessionOutbound
// ---------------------------------------------------------------------------

/// What the session layer asks a connection task to send to its client.
///
/// Payloads are already encoded with the server's codec; the connection
/// task only wraps them in an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutbound {
    /// The player's current data.
    PlayerData(Vec<u8>),
    /// A match snapshot sent to everyone.
    GameInfo(Vec<u8>),
    /// Show `reason` to the player and drop the connection.
    Disconnect(String),
}

/// Channel from the session layer to one connection task.
///
/// Unbounded because document hooks push from synchronous code and
/// cannot wait for capacity.
pub type PlayerSender = mpsc::UnboundedSender<SessionOutbound>;

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// The lifecycle state of a player's session.
///
/// ```text
/// Connecting ──open ok──→ Open ──disconnect──→ Closed
///     │
///     ├──open failed──→ Disconnected(reason)
///     └──disconnected while opening──→ Closed
/// ```
///
/// `Closed` and `Disconnected` are terminal: the entry leaves the
/// registry as soon as it reaches either.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
    Disconnected(String),
}

impl SessionState {
    /// Returns `true` if the player's data can be read and pushed.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Disconnected(_))
    }

    /// Returns `true` if transitioning to `target` is valid.
    pub fn can_transition_to(&self, target: &Self) -> bool {
        matches!(
            (self, target),
            (Self::Connecting, Self::Open)
                | (Self::Connecting, Self::Closed)
                | (Self::Connecting, Self::Disconnected(_))
                | (Self::Open, Self::Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Open => write!(f, "Open"),
            Self::Closed => write!(f, "Closed"),
            Self::Disconnected(reason) => write!(f, "Disconnected({reason})"),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionTicket
// ---------------------------------------------------------------------------

/// One connection's claim on a player's session.
///
/// Issued by [`register`](crate::PlayerDataSessions::register). Only the
/// holder of the ticket that created an entry can release it, so a
/// connection never ends a session it does not own.
#[derive(Debug, Clone)]
pub struct SessionTicket {
    pub(crate) player_id: PlayerId,
    pub(crate) id: u64,
    pub(crate) outbound: PlayerSender,
}

impl SessionTicket {
    /// The player this ticket was issued for.
    pub fn player_id(&self) -> PlayerId {
        self.player_id
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A registry entry. Lives from `connect` until the session reaches a
/// terminal state or the manager shuts down.
pub(crate) struct Session<T: Record> {
    pub(crate) player_id: PlayerId,
    /// Id of the ticket that created this entry.
    pub(crate) ticket: u64,
    pub(crate) state: SessionState,
    pub(crate) outbound: PlayerSender,
    /// Set once the open succeeds.
    pub(crate) document: Option<Document<T>>,
    /// A disconnect arrived while the open was still in flight.
    pub(crate) disconnect_requested: bool,
}

impl<T: Record> Session<T> {
    pub(crate) fn connecting(player_id: PlayerId, ticket: u64, outbound: PlayerSender) -> Self {
        Self {
            player_id,
            ticket,
            state: SessionState::Connecting,
            outbound,
            document: None,
            disconnect_requested: false,
        }
    }

    /// Moves to `next`, refusing (and logging) invalid transitions.
    pub(crate) fn advance(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(&next) {
            tracing::error!(
                player_id = %self.player_id,
                from = %self.state,
                to = %next,
                "invalid session transition"
            );
            return false;
        }
        self.state = next;
        true
    }

    /// The open document, if the session is `Open`.
    pub(crate) fn open_document(&self) -> Option<&Document<T>> {
        if self.state.is_open() {
            self.document.as_ref()
        } else {
            None
        }
    }
}
