//! `RampartServer` builder and server loop.
//!
//! This is the entry point for running a Rampart server. It ties together
//! all the layers: transport → protocol → session → retry → document.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rampart_document::{Backend, DocumentStore};
use rampart_protocol::{Codec, GameInfo, JsonCodec, PlayerData};
use rampart_session::{Authenticator, PlayerDataSessions, SessionConfig};
use rampart_transport::{Transport, WebSocketTransport};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::RampartError;
use crate::handler::handle_connection;

type ShutdownSignal = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Shared server state passed to each connection handler task.
pub(crate) struct ServerState<A: Authenticator, C: Codec> {
    pub(crate) sessions: PlayerDataSessions<PlayerData, C>,
    pub(crate) auth: A,
    pub(crate) codec: C,
    pub(crate) handshake_timeout: Duration,
    pub(crate) idle_timeout: Duration,
}

/// Builder for configuring and starting a Rampart server.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use rampart::prelude::*;
///
/// # async fn run() -> Result<(), RampartError> {
/// let server = RampartServerBuilder::new()
///     .bind("0.0.0.0:8080")
///     .autosave_interval(Some(Duration::from_secs(30)))
///     .build(Arc::new(MemoryBackend::new()), NumericTokenAuthenticator)
///     .await?;
/// server.run().await
/// # }
/// ```
pub struct RampartServerBuilder {
    bind_addr: String,
    session_config: SessionConfig,
    autosave_interval: Option<Duration>,
    handshake_timeout: Duration,
    idle_timeout: Duration,
    shutdown_signal: Option<ShutdownSignal>,
}

impl RampartServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            session_config: SessionConfig::default(),
            autosave_interval: Some(Duration::from_secs(60)),
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(15),
            shutdown_signal: None,
        }
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// Sets the session configuration (retry backoff for opens).
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// How often every open document is flushed. `None` disables
    /// autosave; data is then only written by updates and closes.
    pub fn autosave_interval(mut self, interval: Option<Duration>) -> Self {
        self.autosave_interval = interval.filter(|d| !d.is_zero());
        self
    }

    /// How long a new connection has to send its handshake.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// How long a client may stay silent before it is dropped.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Stops the server when `signal` resolves. Defaults to Ctrl-C.
    pub fn shutdown_signal<F>(mut self, signal: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shutdown_signal = Some(Box::pin(signal));
        self
    }

    /// Binds the listener and wires the layers together over `backend`.
    ///
    /// Uses `JsonCodec` and `WebSocketTransport`.
    ///
    /// # Errors
    /// [`RampartError::Transport`] if the address cannot be bound.
    pub async fn build<B, A>(
        self,
        backend: Arc<B>,
        auth: A,
    ) -> Result<RampartServer<A, JsonCodec>, RampartError>
    where
        B: Backend<PlayerData>,
        A: Authenticator,
    {
        let transport = WebSocketTransport::bind(&self.bind_addr).await?;

        let store = DocumentStore::new(backend);
        let sessions = PlayerDataSessions::new(store, JsonCodec, self.session_config);
        let state = Arc::new(ServerState {
            sessions,
            auth,
            codec: JsonCodec,
            handshake_timeout: self.handshake_timeout,
            idle_timeout: self.idle_timeout,
        });

        let shutdown_signal = self.shutdown_signal.unwrap_or_else(|| Box::pin(ctrl_c()));

        Ok(RampartServer {
            transport,
            state,
            autosave_interval: self.autosave_interval,
            shutdown_signal,
        })
    }
}

impl Default for RampartServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for Ctrl-C, shutting down");
    }
}

/// A bound Rampart server.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct RampartServer<A: Authenticator, C: Codec> {
    transport: WebSocketTransport,
    state: Arc<ServerState<A, C>>,
    autosave_interval: Option<Duration>,
    shutdown_signal: ShutdownSignal,
}

impl<A, C> RampartServer<A, C>
where
    A: Authenticator,
    C: Codec + Clone,
{
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// A handle for game logic: broadcasting match state and changing
    /// player data while the server runs.
    pub fn handle(&self) -> ServerHandle<C> {
        ServerHandle {
            sessions: self.state.sessions.clone(),
            codec: self.state.codec.clone(),
        }
    }

    /// Runs the server until the shutdown signal fires.
    ///
    /// Accepts incoming connections and spawns a handler task for each.
    /// On shutdown, stops accepting, then closes every open document
    /// (the final save) before returning.
    pub async fn run(mut self) -> Result<(), RampartError> {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let signal = self.shutdown_signal;
        let final_save = self.state.sessions.setup(async move {
            signal.await;
            let _ = stop_tx.send(());
        })?;

        let autosave = self
            .autosave_interval
            .map(|period| spawn_autosave(self.state.sessions.store().clone(), period));

        tracing::info!("Rampart server running");

        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                accepted = self.transport.accept() => match accepted {
                    Ok(conn) => {
                        let state = Arc::clone(&self.state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(conn, state).await {
                                tracing::debug!(error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                },
            }
        }

        tracing::info!("shutting down, no longer accepting connections");
        if let Some(autosave) = autosave {
            autosave.abort();
        }
        let closed = match final_save.await {
            Ok(closed) => closed,
            Err(e) => {
                tracing::error!(error = %e, "final save task failed");
                0
            }
        };
        self.transport.shutdown().await?;
        tracing::info!(closed, "Rampart server stopped");
        Ok(())
    }
}

/// Flushes every open document once per `period`.
fn spawn_autosave(store: DocumentStore<PlayerData>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if store.is_shut_down() {
                break;
            }
            let flushed = store.flush_all().await;
            tracing::debug!(flushed, "autosave");
        }
    })
}

/// A cloneable handle to a running server's player data.
pub struct ServerHandle<C: Codec> {
    sessions: PlayerDataSessions<PlayerData, C>,
    codec: C,
}

impl<C: Codec + Clone> Clone for ServerHandle<C> {
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
            codec: self.codec.clone(),
        }
    }
}

impl<C: Codec> ServerHandle<C> {
    /// Sends `info` to every player whose data is loaded. Returns how
    /// many players it reached.
    ///
    /// # Errors
    /// [`RampartError::Protocol`] if `info` cannot be encoded.
    pub fn broadcast_game_info(&self, info: &GameInfo) -> Result<usize, RampartError> {
        let bytes = self.codec.encode(info)?;
        let reached = self.sessions.broadcast(&bytes);
        tracing::debug!(reached, wave = info.wave, "game info broadcast");
        Ok(reached)
    }

    /// The player-data sessions, for game logic that changes a player's
    /// saved data (see [`PlayerDataSessions::mutate`]).
    pub fn sessions(&self) -> &PlayerDataSessions<PlayerData, C> {
        &self.sessions
    }
}
