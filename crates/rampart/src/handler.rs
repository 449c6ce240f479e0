//! Per-connection handler: handshake, player-data session, message routing.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The flow is:
//!   1. Receive Handshake → validate version
//!   2. Authenticate token → get PlayerId, send HandshakeAck
//!   3. Register the player's session, then open their data in its own
//!      task so a client that leaves mid-open cannot cancel it
//!   4. Loop: forward session pushes to the client, answer client messages

use std::sync::Arc;

use rampart_protocol::{
    Codec, Envelope, Message, PROTOCOL_VERSION, PlayerData, PlayerId, ProtocolError,
};
use rampart_session::{
    Authenticator, ConnectOutcome, PlayerDataSessions, PlayerSender, SessionError,
    SessionOutbound, SessionTicket,
};
use rampart_transport::{Connection, WebSocketConnection};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::RampartError;
use crate::server::ServerState;

/// Drop guard that ends this connection's session when the handler exits.
///
/// Created as soon as the session is registered, so every exit path,
/// including `?`, releases it. The guard holds the registration ticket,
/// so it only ever ends the session this connection registered.
///
/// The normal exit path calls [`release`](SessionGuard::release) so the
/// final save finishes before the task ends. Otherwise `Drop` spawns the
/// release as a fire-and-forget task.
struct SessionGuard<C: Codec> {
    ticket: SessionTicket,
    sessions: Option<PlayerDataSessions<PlayerData, C>>,
}

impl<C: Codec> SessionGuard<C> {
    fn new(ticket: SessionTicket, sessions: PlayerDataSessions<PlayerData, C>) -> Self {
        Self {
            ticket,
            sessions: Some(sessions),
        }
    }

    async fn release(mut self) {
        if let Some(sessions) = self.sessions.take() {
            end_session(&sessions, &self.ticket).await;
        }
    }
}

impl<C: Codec> Drop for SessionGuard<C> {
    fn drop(&mut self) {
        if let Some(sessions) = self.sessions.take() {
            let ticket = self.ticket.clone();
            tokio::spawn(async move {
                end_session(&sessions, &ticket).await;
            });
        }
    }
}

async fn end_session<C: Codec>(sessions: &PlayerDataSessions<PlayerData, C>, ticket: &SessionTicket) {
    let player_id = ticket.player_id();
    match sessions.release(ticket).await {
        Ok(outcome) => tracing::debug!(%player_id, ?outcome, "session released"),
        // Already gone: the open failed, or shutdown closed it.
        Err(SessionError::NotFound(_)) => {}
        Err(e) => tracing::warn!(%player_id, error = %e, "session release failed"),
    }
}

/// Writes envelopes with increasing sequence numbers.
struct Outgoing<'a, C: Codec> {
    conn: &'a WebSocketConnection,
    codec: &'a C,
    seq: u64,
    start: Instant,
}

impl<'a, C: Codec> Outgoing<'a, C> {
    fn new(conn: &'a WebSocketConnection, codec: &'a C) -> Self {
        Self {
            conn,
            codec,
            seq: 0,
            start: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    async fn send(&mut self, message: Message) -> Result<(), RampartError> {
        let envelope = Envelope::new(self.seq, self.elapsed_ms(), message);
        self.seq += 1;
        let bytes = self.codec.encode(&envelope)?;
        self.conn.send(&bytes).await?;
        Ok(())
    }

    async fn send_error(&mut self, code: u16, message: &str) -> Result<(), RampartError> {
        self.send(Message::Error {
            code,
            message: message.to_string(),
        })
        .await
    }

    async fn send_heartbeat_ack(&mut self, client_time: u64) -> Result<(), RampartError> {
        let server_time = self.elapsed_ms();
        self.send(Message::HeartbeatAck {
            client_time,
            server_time,
        })
        .await
    }

    /// Sends `Disconnect { reason }`, then closes the socket with the same
    /// reason.
    async fn disconnect(&mut self, reason: &str) -> Result<(), RampartError> {
        self.send(Message::Disconnect {
            reason: reason.to_string(),
        })
        .await?;
        self.conn.close_with_reason(reason).await?;
        Ok(())
    }

    /// Forwards one session push. Returns `true` if the connection must
    /// close.
    async fn forward(&mut self, outbound: SessionOutbound) -> Result<bool, RampartError> {
        match outbound {
            SessionOutbound::PlayerData(data) => {
                self.send(Message::PlayerData { data }).await?;
                Ok(false)
            }
            SessionOutbound::GameInfo(data) => {
                self.send(Message::GameInfo { data }).await?;
                Ok(false)
            }
            SessionOutbound::Disconnect(reason) => {
                self.disconnect(&reason).await?;
                Ok(true)
            }
        }
    }
}

/// Receives the next decodable message. `Ok(None)` on a clean close.
/// Frames that fail to decode are logged and skipped.
async fn recv_message<C: Codec>(
    conn: &WebSocketConnection,
    codec: &C,
) -> Result<Option<Message>, RampartError> {
    loop {
        let Some(data) = conn.recv().await? else {
            return Ok(None);
        };
        match codec.decode::<Envelope>(&data) {
            Ok(envelope) => return Ok(Some(envelope.message)),
            Err(e) => {
                tracing::debug!(conn_id = %conn.id(), error = %e, "failed to decode envelope");
            }
        }
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<A, C>(
    conn: WebSocketConnection,
    state: Arc<ServerState<A, C>>,
) -> Result<(), RampartError>
where
    A: Authenticator,
    C: Codec,
{
    let conn_id = conn.id();
    tracing::debug!(%conn_id, peer = %conn.peer_addr(), "handling new connection");

    let mut out = Outgoing::new(&conn, &state.codec);

    // --- Step 1: Handshake ---
    let player_id = perform_handshake(&conn, &state, &mut out).await?;
    tracing::info!(%conn_id, %player_id, "player authenticated");

    // --- Step 2: Open the player's data ---
    let (tx, mut rx) = mpsc::unbounded_channel();
    let Some(guard) = open_session(&conn, &state, &mut out, player_id, &tx, &mut rx).await? else {
        return Ok(());
    };

    // --- Step 3: Message loop ---
    let result = run_session(&conn, &state, &mut out, player_id, &tx, &mut rx).await;

    // Final save before the task ends.
    guard.release().await;
    result
}

/// Performs the initial handshake: receive Handshake, validate, auth, send Ack.
async fn perform_handshake<A, C>(
    conn: &WebSocketConnection,
    state: &ServerState<A, C>,
    out: &mut Outgoing<'_, C>,
) -> Result<PlayerId, RampartError>
where
    A: Authenticator,
    C: Codec,
{
    let message = match tokio::time::timeout(state.handshake_timeout, recv_message(conn, &state.codec))
        .await
    {
        Ok(Ok(Some(message))) => message,
        Ok(Ok(None)) => {
            return Err(ProtocolError::InvalidMessage(
                "connection closed before handshake".into(),
            )
            .into());
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            return Err(ProtocolError::InvalidMessage("handshake timed out".into()).into());
        }
    };

    let Message::Handshake { version, token } = message else {
        out.send_error(400, "expected Handshake").await?;
        return Err(ProtocolError::InvalidMessage("first message must be Handshake".into()).into());
    };

    if version != PROTOCOL_VERSION {
        out.send_error(
            400,
            &format!("version mismatch: expected {PROTOCOL_VERSION}, got {version}"),
        )
        .await?;
        return Err(ProtocolError::InvalidMessage("protocol version mismatch".into()).into());
    }

    let token = token.as_deref().unwrap_or("");
    let player_id = match state.auth.authenticate(token).await {
        Ok(player_id) => player_id,
        Err(e) => {
            out.send_error(401, "unauthorized").await?;
            return Err(e.into());
        }
    };

    let server_time = out.elapsed_ms();
    out.send(Message::HandshakeAck {
        player_id,
        server_time,
    })
    .await?;

    Ok(player_id)
}

/// Registers the player's session, then opens their data while still
/// serving the client.
///
/// Returns the guard for an open session, or `None` if the connection
/// is done (the open failed, or the client left while it was in flight).
async fn open_session<A, C>(
    conn: &WebSocketConnection,
    state: &ServerState<A, C>,
    out: &mut Outgoing<'_, C>,
    player_id: PlayerId,
    tx: &PlayerSender,
    rx: &mut mpsc::UnboundedReceiver<SessionOutbound>,
) -> Result<Option<SessionGuard<C>>, RampartError>
where
    A: Authenticator,
    C: Codec,
{
    let ticket = match state.sessions.register(player_id, tx.clone()) {
        Ok(ticket) => ticket,
        Err(SessionError::AlreadyConnected(_)) => {
            out.send_error(409, "already connected").await?;
            conn.close().await?;
            return Err(SessionError::AlreadyConnected(player_id).into());
        }
        Err(e) => return Err(e.into()),
    };
    let guard = SessionGuard::new(ticket.clone(), state.sessions.clone());

    // Runs in its own task so a client that leaves cannot cancel the
    // open; the released ticket closes the document once it settles.
    let mut connecting = tokio::spawn({
        let sessions = state.sessions.clone();
        async move { sessions.open(&ticket).await }
    });

    // A refresh that arrives before the data is loaded is answered once
    // it is.
    let mut refresh_requested = false;
    let mut deadline = Instant::now() + state.idle_timeout;

    let joined = loop {
        tokio::select! {
            joined = &mut connecting => break joined,
            received = recv_message(conn, &state.codec) => {
                let message = match received {
                    Ok(Some(message)) => message,
                    Ok(None) | Err(_) => {
                        tracing::info!(%player_id, "client left while data was loading");
                        guard.release().await;
                        return Ok(None);
                    }
                };
                deadline = Instant::now() + state.idle_timeout;
                match message {
                    Message::RequestPlayerData => refresh_requested = true,
                    Message::Heartbeat { client_time } => out.send_heartbeat_ack(client_time).await?,
                    Message::Disconnect { reason } => {
                        tracing::info!(%player_id, %reason, "client disconnected while data was loading");
                        guard.release().await;
                        return Ok(None);
                    }
                    _ => tracing::debug!(%player_id, "ignoring message while data is loading"),
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                tracing::info!(%player_id, "connection timed out while data was loading");
                guard.release().await;
                return Ok(None);
            }
        }
    };

    let outcome = match joined {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(%player_id, error = %e, "connect task failed");
            guard.release().await;
            return Ok(None);
        }
    };

    match outcome {
        ConnectOutcome::Open { .. } => {
            if refresh_requested {
                state.sessions.refresh(player_id, tx)?;
            }
            Ok(Some(guard))
        }
        ConnectOutcome::Disconnected(failure) => {
            tracing::info!(%player_id, error = %failure, "disconnecting player");
            guard.release().await;
            // The session queued the disconnect message.
            while let Ok(outbound) = rx.try_recv() {
                if out.forward(outbound).await? {
                    break;
                }
            }
            Ok(None)
        }
        ConnectOutcome::ClosedBeforeOpen => {
            guard.release().await;
            Ok(None)
        }
    }
}

/// The main loop for an open session.
async fn run_session<A, C>(
    conn: &WebSocketConnection,
    state: &ServerState<A, C>,
    out: &mut Outgoing<'_, C>,
    player_id: PlayerId,
    tx: &PlayerSender,
    rx: &mut mpsc::UnboundedReceiver<SessionOutbound>,
) -> Result<(), RampartError>
where
    A: Authenticator,
    C: Codec,
{
    let mut deadline = Instant::now() + state.idle_timeout;

    loop {
        tokio::select! {
            Some(outbound) = rx.recv() => {
                if out.forward(outbound).await? {
                    return Ok(());
                }
            }
            received = recv_message(conn, &state.codec) => {
                let message = match received {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        tracing::info!(%player_id, "connection closed cleanly");
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::debug!(%player_id, error = %e, "recv error");
                        return Ok(());
                    }
                };
                deadline = Instant::now() + state.idle_timeout;
                if handle_message(state, out, player_id, tx, message).await? {
                    return Ok(());
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                tracing::info!(%player_id, "connection timed out");
                return Ok(());
            }
        }
    }
}

/// Handles one client message. Returns `true` if the connection should
/// close.
async fn handle_message<A, C>(
    state: &ServerState<A, C>,
    out: &mut Outgoing<'_, C>,
    player_id: PlayerId,
    tx: &PlayerSender,
    message: Message,
) -> Result<bool, RampartError>
where
    A: Authenticator,
    C: Codec,
{
    match message {
        Message::RequestPlayerData => {
            // The reply goes through the outbound channel like every
            // other push, so it is ordered after earlier updates.
            if let Err(e) = state.sessions.refresh(player_id, tx) {
                tracing::warn!(%player_id, error = %e, "player data refresh failed");
            }
        }

        Message::Heartbeat { client_time } => {
            out.send_heartbeat_ack(client_time).await?;
        }

        Message::Disconnect { reason } => {
            tracing::info!(%player_id, %reason, "client disconnected");
            return Ok(true);
        }

        _ => {
            tracing::debug!(%player_id, "ignoring unexpected message");
        }
    }

    Ok(false)
}
