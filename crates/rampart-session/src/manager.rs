//! The player-data session manager: one document per connected player.
//!
//! This is the central piece of the session layer. It's responsible for:
//! - Opening a player's document (with retries) when they connect
//! - Pushing their data to the client whenever it changes
//! - Answering the client's refresh requests
//! - Closing the document when they leave, or all documents at shutdown
//!
//! # Concurrency note
//!
//! The registry is a `std::sync::Mutex<HashMap>` that is never held
//! across an `.await`. The only suspension points in `connect` are the
//! backend open and the retry backoff, so one slow player never blocks
//! another. Per-player ordering comes from the registry itself: a player
//! has at most one entry, and a disconnect that arrives while their open
//! is in flight is recorded on the entry and applied once the open
//! settles.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rampart_document::{Document, DocumentError, DocumentEvent, DocumentKey, DocumentStore, Record};
use rampart_protocol::{Codec, PlayerId};
use rampart_retry::{OpenFailure, RetryPolicy, open_with_retry};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::messages::{MISSING_DOCUMENT_MESSAGE, disconnect_message};
use crate::session::Session;
use crate::{
    PlayerSender, SessionConfig, SessionError, SessionOutbound, SessionState, SessionTicket,
};

/// How a [`connect`](PlayerDataSessions::connect) ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The document is open and the session is live.
    ///
    /// `created` is `true` if this connect opened the document (rather
    /// than finding it already open); `fresh_record` is `true` if the
    /// backend had no record and created one.
    Open { created: bool, fresh_record: bool },
    /// The open failed; the player was sent a disconnect message and the
    /// entry is gone.
    Disconnected(OpenFailure),
    /// The player disconnected while the open was in flight; the document
    /// was closed as soon as it opened.
    ClosedBeforeOpen,
}

/// How a [`refresh`](PlayerDataSessions::refresh) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The player's data was pushed.
    Pushed,
    /// The player has no open session and was sent a disconnect message.
    Disconnected,
}

/// How a [`disconnect`](PlayerDataSessions::disconnect) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// The document was closed and the entry removed.
    Closed,
    /// The open is still in flight; the document is closed when it settles.
    Deferred,
}

/// Manages the player-data session of every connected player.
///
/// Cheap to clone: clones share the same registry and store.
///
/// ## Lifecycle
///
/// ```text
/// register() ─→ [Connecting] ──open ok──→ [Open] ──disconnect()──→ [Closed]
///                    │                       │
///                    │ open failed           └── refresh() / mutate() / broadcast()
///                    ▼
///             [Disconnected(reason)]
///
/// shutdown() ──→ every document closed, registry cleared
/// ```
pub struct PlayerDataSessions<T: Record, C: Codec> {
    inner: Arc<Inner<T, C>>,
}

struct Inner<T: Record, C: Codec> {
    store: DocumentStore<T>,
    codec: Arc<C>,
    policy: RetryPolicy,
    sessions: Mutex<HashMap<PlayerId, Session<T>>>,
    set_up: AtomicBool,
    next_ticket: AtomicU64,
}

impl<T: Record, C: Codec> Clone for PlayerDataSessions<T, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, C> PlayerDataSessions<T, C>
where
    T: Record + Serialize,
    C: Codec,
{
    /// Creates an empty manager over `store`.
    pub fn new(store: DocumentStore<T>, codec: C, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                codec: Arc::new(codec),
                policy: RetryPolicy::new(config.retry),
                sessions: Mutex::new(HashMap::new()),
                set_up: AtomicBool::new(false),
                next_ticket: AtomicU64::new(0),
            }),
        }
    }

    /// Wires the manager to the process lifecycle: once `shutdown_signal`
    /// resolves, [`shutdown`](Self::shutdown) runs. The handle resolves to
    /// the number of documents shutdown closed.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// [`SessionError::DuplicateSetup`] if this manager was already set up.
    pub fn setup<F>(&self, shutdown_signal: F) -> Result<JoinHandle<usize>, SessionError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.inner.set_up.swap(true, Ordering::AcqRel) {
            return Err(SessionError::DuplicateSetup);
        }

        let sessions = self.clone();
        Ok(tokio::spawn(async move {
            shutdown_signal.await;
            info!("shutdown signal received, closing player data");
            sessions.shutdown().await
        }))
    }

    /// Opens `player`'s document and starts pushing their data to
    /// `outbound`. Shorthand for [`register`](Self::register) followed by
    /// [`open`](Self::open).
    ///
    /// Load failures are not errors: the player is sent
    /// [`SessionOutbound::Disconnect`] with a message matching the
    /// failure, and the outcome says why.
    ///
    /// # Errors
    /// [`SessionError::AlreadyConnected`] if `player` already has a
    /// session, connecting or open.
    pub async fn connect(
        &self,
        player: PlayerId,
        outbound: PlayerSender,
    ) -> Result<ConnectOutcome, SessionError> {
        let ticket = self.register(player, outbound)?;
        Ok(self.open(&ticket).await)
    }

    /// Claims a `Connecting` entry for `player` without opening anything.
    ///
    /// The returned ticket is the only handle that can
    /// [`release`](Self::release) the entry, so a connection that leaves
    /// before or during [`open`](Self::open) cleans up its own session
    /// and never someone else's.
    ///
    /// # Errors
    /// [`SessionError::AlreadyConnected`] if `player` already has a
    /// session, connecting or open.
    pub fn register(
        &self,
        player: PlayerId,
        outbound: PlayerSender,
    ) -> Result<SessionTicket, SessionError> {
        let id = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        {
            let mut sessions = self.lock_sessions();
            if sessions.contains_key(&player) {
                warn!(player_id = %player, "duplicate connect rejected");
                return Err(SessionError::AlreadyConnected(player));
            }
            sessions.insert(player, Session::connecting(player, id, outbound.clone()));
        }
        debug!(player_id = %player, ticket = id, "session connecting");
        Ok(SessionTicket {
            player_id: player,
            id,
            outbound,
        })
    }

    /// Opens the document for a registered session, with retries.
    ///
    /// If the ticket was released while the open was in flight, the
    /// document is closed as soon as it opens.
    pub async fn open(&self, ticket: &SessionTicket) -> ConnectOutcome {
        let player = ticket.player_id;
        let key = DocumentKey::from(player.0);
        match open_with_retry(&self.inner.store, &key, &self.inner.policy).await {
            Ok((document, created)) => self.finish_open(ticket, document, created).await,
            Err(failure) => {
                let message = disconnect_message(&failure);
                let requested = {
                    let mut sessions = self.lock_sessions();
                    let owned = sessions
                        .get(&player)
                        .is_some_and(|session| session.ticket == ticket.id);
                    let removed = if owned { sessions.remove(&player) } else { None };
                    match removed {
                        Some(mut session) => {
                            session.advance(SessionState::Disconnected(message.clone()));
                            session.disconnect_requested
                        }
                        None => false,
                    }
                };
                // A player who already left gets nothing more.
                if !requested {
                    let _ = ticket.outbound.send(SessionOutbound::Disconnect(message));
                }
                warn!(player_id = %player, error = %failure, "player data failed to load");
                ConnectOutcome::Disconnected(failure)
            }
        }
    }

    async fn finish_open(
        &self,
        ticket: &SessionTicket,
        document: Document<T>,
        created: bool,
    ) -> ConnectOutcome {
        let player = ticket.player_id;
        let fresh_record = document.is_fresh_record();
        let opened = {
            let mut sessions = self.lock_sessions();
            let staying = sessions
                .get_mut(&player)
                .filter(|session| session.ticket == ticket.id && !session.disconnect_requested);
            if let Some(session) = staying {
                self.install_push_hook(&document, player, session.outbound.clone());
                session.document = Some(document.clone());
                session.advance(SessionState::Open)
            } else {
                // Either the player left, or shutdown cleared the registry
                // while the open was in flight.
                if sessions
                    .get(&player)
                    .is_some_and(|session| session.ticket == ticket.id)
                {
                    sessions.remove(&player);
                }
                false
            }
        };

        if opened {
            info!(player_id = %player, created, fresh_record, "session open");
            return ConnectOutcome::Open {
                created,
                fresh_record,
            };
        }

        match document.close().await {
            Ok(()) | Err(DocumentError::AlreadyClosed(_)) => {}
            Err(e) => warn!(player_id = %player, error = %e, "final save failed"),
        }
        info!(player_id = %player, "player left before their data loaded");
        ConnectOutcome::ClosedBeforeOpen
    }

    /// Pushes every `Update` of the document to the player.
    fn install_push_hook(&self, document: &Document<T>, player: PlayerId, outbound: PlayerSender) {
        let codec = Arc::clone(&self.inner.codec);
        document.hook_after(DocumentEvent::Update, move |value: &T| {
            match codec.encode(value) {
                Ok(bytes) => {
                    let _ = outbound.send(SessionOutbound::PlayerData(bytes));
                }
                Err(e) => warn!(player_id = %player, error = %e, "player data push failed"),
            }
        });
    }

    /// Sends `player`'s current data to `reply`.
    ///
    /// A player with no open session should never ask; if one does, they
    /// are sent the report-this-issue disconnect instead.
    ///
    /// # Errors
    /// [`SessionError::Encode`] if the data cannot be encoded.
    pub fn refresh(
        &self,
        player: PlayerId,
        reply: &PlayerSender,
    ) -> Result<RefreshOutcome, SessionError> {
        let document = self.document(player);
        let Some(document) = document else {
            warn!(player_id = %player, "player data requested without an open session");
            let _ = reply.send(SessionOutbound::Disconnect(MISSING_DOCUMENT_MESSAGE.to_string()));
            return Ok(RefreshOutcome::Disconnected);
        };

        let bytes = self.inner.codec.encode(&document.get_cache())?;
        let _ = reply.send(SessionOutbound::PlayerData(bytes));
        debug!(player_id = %player, "player data refreshed");
        Ok(RefreshOutcome::Pushed)
    }

    /// Ends `player`'s session, closing their document.
    ///
    /// # Errors
    /// [`SessionError::NotFound`] if the player has no session.
    pub async fn disconnect(&self, player: PlayerId) -> Result<DisconnectOutcome, SessionError> {
        self.end(player, None).await
    }

    /// Ends the session `ticket` registered. A session registered by a
    /// later ticket for the same player is left alone.
    ///
    /// # Errors
    /// [`SessionError::NotFound`] if the ticket's session is gone.
    pub async fn release(&self, ticket: &SessionTicket) -> Result<DisconnectOutcome, SessionError> {
        self.end(ticket.player_id, Some(ticket.id)).await
    }

    async fn end(
        &self,
        player: PlayerId,
        ticket: Option<u64>,
    ) -> Result<DisconnectOutcome, SessionError> {
        let document = {
            let mut sessions = self.lock_sessions();
            let Some(session) = sessions
                .get_mut(&player)
                .filter(|session| ticket.is_none_or(|id| session.ticket == id))
            else {
                return Err(SessionError::NotFound(player));
            };
            if session.state == SessionState::Connecting {
                session.disconnect_requested = true;
                debug!(player_id = %player, "disconnect deferred until open settles");
                return Ok(DisconnectOutcome::Deferred);
            }
            sessions.remove(&player).and_then(|mut session| {
                session.advance(SessionState::Closed);
                session.document
            })
        };

        if let Some(document) = document {
            match document.close().await {
                Ok(()) => {}
                // Shutdown got there first.
                Err(DocumentError::AlreadyClosed(_)) => {}
                Err(e) => warn!(player_id = %player, error = %e, "final save failed"),
            }
        }
        info!(player_id = %player, "session closed");
        Ok(DisconnectOutcome::Closed)
    }

    /// Closes every document and clears the registry. Returns how many
    /// documents were closed.
    pub async fn shutdown(&self) -> usize {
        let closed = self.inner.store.close_all_documents().await;
        let cleared = {
            let mut sessions = self.lock_sessions();
            let count = sessions.len();
            sessions.clear();
            count
        };
        info!(closed, sessions = cleared, "player data sessions shut down");
        closed
    }

    /// Sends pre-encoded game info to every open session. Returns how
    /// many players it reached.
    pub fn broadcast(&self, bytes: &[u8]) -> usize {
        let sessions = self.lock_sessions();
        sessions
            .values()
            .filter(|session| session.state.is_open())
            .filter(|session| {
                session
                    .outbound
                    .send(SessionOutbound::GameInfo(bytes.to_vec()))
                    .is_ok()
            })
            .count()
    }

    /// Applies `transform` to `player`'s data and saves it. The change is
    /// pushed to the player by the session's update hook.
    ///
    /// # Errors
    /// - [`SessionError::NotFound`] if the player has no open session,
    ///   including one whose document closes before the update runs.
    /// - [`SessionError::Document`] if the save failed.
    pub async fn mutate<F>(&self, player: PlayerId, transform: F) -> Result<T, SessionError>
    where
        F: FnOnce(&mut T) + Send,
    {
        let document = self.document(player).ok_or(SessionError::NotFound(player))?;
        document
            .try_update(transform)
            .await?
            .ok_or(SessionError::NotFound(player))
    }

    /// The open document for `player`.
    pub fn document(&self, player: PlayerId) -> Option<Document<T>> {
        self.lock_sessions()
            .get(&player)
            .and_then(|session| session.open_document().cloned())
    }

    /// The state of `player`'s session, if they have one.
    pub fn state(&self, player: PlayerId) -> Option<SessionState> {
        self.lock_sessions()
            .get(&player)
            .map(|session| session.state.clone())
    }

    /// Number of sessions, connecting or open.
    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    /// Players with an open session, in no particular order.
    pub fn open_players(&self) -> Vec<PlayerId> {
        self.lock_sessions()
            .values()
            .filter(|session| session.state.is_open())
            .map(|session| session.player_id)
            .collect()
    }

    pub fn store(&self) -> &DocumentStore<T> {
        &self.inner.store
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<PlayerId, Session<T>>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
