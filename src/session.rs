//! Session controller.
//!
//! A [`Session`] drives one endpoint through its lifecycle:
//!
//! ```text
//! Idle ─► Listening / Connecting ─► Handshaking ─► Active ─► Closed
//!              ▲                                              │
//!              └────────── server restart (auto_restart) ◄────┘
//! ```
//!
//! The first connection is set up by [`Session::open`] (or
//! [`SessionListener::accept`]) so handshake failures reach the caller.
//! After that a supervisor task watches the duplex channel. When the peer
//! sends `closed`, hangs up, or the channel fails, the supervisor tears the
//! channel down with a bounded join and, for a server with `auto_restart`,
//! accepts the next peer on the same listener.
//!
//! # Example
//!
//! ```ignore
//! use crossfire_wire::{Command, Session};
//!
//! let session = Session::builder_client()
//!     .host("127.0.0.1")
//!     .port(5000)
//!     .tool("console")
//!     .open()
//!     .await?;
//!
//! let seq = session.send(Command::new("", "version"))?;
//! while let Some(message) = session.recv().await {
//!     println!("{:?}", message);
//! }
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Map;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::channel::{ChannelConfig, ChannelExit, DuplexChannel, Outbox};
use crate::error::{CrossfireError, Result};
use crate::handshake::Role;
use crate::protocol::{Command, Message, CLOSED_EVENT, DEFAULT_MAX_CONTENT_LENGTH};
use crate::sequence::SequenceCorrelator;
use crate::transport::{connect, Connection, Listener};

/// Default host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default port.
pub const DEFAULT_PORT: u16 = 5000;

/// Default handshake timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bounded join window on shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing opened yet.
    Idle,
    /// Server bound, waiting for a peer.
    Listening,
    /// Client dialing out.
    Connecting,
    /// Greeting exchange in flight.
    Handshaking,
    /// Channel running.
    Active,
    /// Connection torn down.
    Closed,
}

impl SessionState {
    /// Status as reported to listeners, for the given role.
    pub fn status(self, role: Role) -> ConnectionStatus {
        match self {
            SessionState::Idle | SessionState::Closed => ConnectionStatus::Disconnected,
            SessionState::Listening => ConnectionStatus::WaitServer,
            SessionState::Connecting | SessionState::Handshaking => ConnectionStatus::Connecting,
            SessionState::Active => match role {
                Role::Server => ConnectionStatus::ConnectedServer,
                Role::Client => ConnectionStatus::ConnectedClient,
            },
        }
    }
}

/// Coarse connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No connection.
    Disconnected,
    /// Server waiting for a peer.
    WaitServer,
    /// Connecting or handshaking.
    Connecting,
    /// Connected, server side.
    ConnectedServer,
    /// Connected, client side.
    ConnectedClient,
}

impl ConnectionStatus {
    /// Wire-compatible status name.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::WaitServer => "wait_server",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::ConnectedServer => "connected_server",
            ConnectionStatus::ConnectedClient => "connected_client",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server (debuggee) or client (debugger).
    pub role: Role,
    /// Host to bind or connect to.
    pub host: String,
    /// Port to bind or connect to. 0 binds a free port.
    pub port: u16,
    /// Bound on the greeting exchange.
    pub handshake_timeout: Duration,
    /// Bound on a single socket read. `None` allows idle peers.
    pub read_timeout: Option<Duration>,
    /// Bounded join window for the channel loops.
    pub shutdown_timeout: Duration,
    /// Client: tools to request. Server: tools supported (empty = all).
    pub tools: Vec<String>,
    /// Server only: accept the next peer after a connection ends.
    pub auto_restart: bool,
    /// First sequence number handed out.
    pub first_sequence: u64,
    /// Largest accepted `Content-Length`.
    pub max_content_length: usize,
    /// Send a `closed` event before a local close.
    pub announce_close: bool,
}

impl SessionConfig {
    /// Default configuration for a role.
    pub fn new(role: Role) -> Self {
        Self {
            role,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            read_timeout: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            tools: Vec::new(),
            auto_restart: true,
            first_sequence: 1,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            announce_close: true,
        }
    }

    fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            read_timeout: self.read_timeout,
            max_content_length: self.max_content_length,
        }
    }

    fn restarts_enabled(&self) -> bool {
        self.role == Role::Server && self.auto_restart
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(Role::Server)
    }
}

/// Builder for configuring and opening a session.
#[derive(Debug, Clone)]
pub struct SessionBuilder {
    config: SessionConfig,
}

impl SessionBuilder {
    /// Create a builder for the given role.
    pub fn new(role: Role) -> Self {
        Self {
            config: SessionConfig::new(role),
        }
    }

    /// Set the host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the handshake timeout.
    ///
    /// Default: 10 seconds
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Bound every socket read.
    ///
    /// Default: none
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = Some(timeout);
        self
    }

    /// Set the bounded join window used on shutdown.
    ///
    /// Default: 10 seconds
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Add a tool (requested by a client, supported by a server).
    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.config.tools.push(tool.into());
        self
    }

    /// Replace the tool list.
    pub fn tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    /// Enable or disable server restarts.
    ///
    /// Default: true
    pub fn auto_restart(mut self, enabled: bool) -> Self {
        self.config.auto_restart = enabled;
        self
    }

    /// Set the first sequence number.
    ///
    /// Default: 1
    pub fn first_sequence(mut self, first: u64) -> Self {
        self.config.first_sequence = first;
        self
    }

    /// Set the largest accepted body.
    ///
    /// Default: 64 MiB
    pub fn max_content_length(mut self, limit: usize) -> Self {
        self.config.max_content_length = limit;
        self
    }

    /// Enable or disable the `closed` announcement on local close.
    ///
    /// Default: true
    pub fn announce_close(mut self, enabled: bool) -> Self {
        self.config.announce_close = enabled;
        self
    }

    /// Get the built configuration.
    pub fn config(self) -> SessionConfig {
        self.config
    }

    /// Open the session. See [`Session::open`].
    pub async fn open(self) -> Result<Session> {
        Session::open(self.config).await
    }

    /// Bind a server without accepting yet. See [`Session::bind`].
    pub async fn bind(self) -> Result<SessionListener> {
        Session::bind(self.config).await
    }
}

/// State shared between the session handle and its supervisor.
#[derive(Debug)]
struct Shared {
    role: Role,
    state: watch::Sender<SessionState>,
    outbox: RwLock<Option<Outbox>>,
    tools: RwLock<Vec<String>>,
    peer_addr: RwLock<Option<SocketAddr>>,
    last_exit: RwLock<Option<ChannelExit>>,
    restarts: AtomicU64,
    correlator: Arc<SequenceCorrelator>,
}

impl Shared {
    fn new(config: &SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            role: config.role,
            state,
            outbox: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
            peer_addr: RwLock::new(None),
            last_exit: RwLock::new(None),
            restarts: AtomicU64::new(0),
            correlator: Arc::new(SequenceCorrelator::new(config.first_sequence)),
        }
    }

    fn set_state(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!("Session state {:?} -> {:?}", prev, next);
        }
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn attach(&self, outbox: Outbox, tools: Vec<String>, peer: SocketAddr) {
        *write(&self.outbox) = Some(outbox);
        *write(&self.tools) = tools;
        *write(&self.peer_addr) = Some(peer);
    }

    fn detach(&self) {
        *write(&self.outbox) = None;
        *write(&self.peer_addr) = None;
    }

    fn outbox(&self) -> Option<Outbox> {
        read(&self.outbox).clone()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// A bound server that has not accepted its first peer yet.
#[derive(Debug)]
pub struct SessionListener {
    config: SessionConfig,
    shared: Arc<Shared>,
    listener: Listener,
}

impl SessionListener {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept the first peer and run the handshake.
    ///
    /// # Errors
    ///
    /// Returns the accept or handshake error; the listener is dropped.
    pub async fn accept(self) -> Result<Session> {
        let SessionListener {
            config,
            shared,
            listener,
        } = self;

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let channel = match accept_peer(&listener, &config, &shared, &incoming_tx).await {
            Ok(channel) => channel,
            Err(e) => {
                shared.set_state(SessionState::Closed);
                return Err(e);
            }
        };

        shared.set_state(SessionState::Active);
        let local_addr = listener.local_addr().ok();
        Ok(Session::start(
            config,
            shared,
            Some(listener),
            local_addr,
            channel,
            incoming_tx,
            incoming_rx,
        ))
    }
}

/// A running endpoint.
///
/// All methods take `&self`; a session can be shared behind an `Arc`.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    shared: Arc<Shared>,
    local_addr: Option<SocketAddr>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    stop: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Builder for a server session.
    pub fn builder_server() -> SessionBuilder {
        SessionBuilder::new(Role::Server)
    }

    /// Builder for a client session.
    pub fn builder_client() -> SessionBuilder {
        SessionBuilder::new(Role::Client)
    }

    /// Open a session and establish its first connection.
    ///
    /// A server binds and waits for the first peer; a client connects out.
    /// Returns once the handshake succeeded.
    ///
    /// # Errors
    ///
    /// - `Handshake` / `HandshakeTimeout` if the greeting exchange failed
    /// - `Io` if binding, accepting or connecting failed
    pub async fn open(config: SessionConfig) -> Result<Self> {
        match config.role {
            Role::Server => Self::bind(config).await?.accept().await,
            Role::Client => Self::connect(config).await,
        }
    }

    /// Bind a server without waiting for a peer.
    ///
    /// Useful with port 0: read the bound address, then
    /// [`accept`](SessionListener::accept).
    pub async fn bind(mut config: SessionConfig) -> Result<SessionListener> {
        config.role = Role::Server;
        let shared = Arc::new(Shared::new(&config));
        shared.set_state(SessionState::Listening);

        match Listener::bind(&config.host, config.port).await {
            Ok(listener) => Ok(SessionListener {
                config,
                shared,
                listener,
            }),
            Err(e) => {
                shared.set_state(SessionState::Closed);
                Err(e)
            }
        }
    }

    async fn connect(config: SessionConfig) -> Result<Self> {
        let shared = Arc::new(Shared::new(&config));
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        shared.set_state(SessionState::Connecting);
        let result = match connect(&config.host, config.port).await {
            Ok(conn) => establish(conn, &config, &shared, &incoming_tx).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(channel) => {
                shared.set_state(SessionState::Active);
                Ok(Self::start(
                    config,
                    shared,
                    None,
                    None,
                    channel,
                    incoming_tx,
                    incoming_rx,
                ))
            }
            Err(e) => {
                shared.set_state(SessionState::Closed);
                Err(e)
            }
        }
    }

    fn start(
        config: SessionConfig,
        shared: Arc<Shared>,
        listener: Option<Listener>,
        local_addr: Option<SocketAddr>,
        channel: DuplexChannel,
        incoming_tx: mpsc::UnboundedSender<Message>,
        incoming_rx: mpsc::UnboundedReceiver<Message>,
    ) -> Self {
        let (stop, stop_rx) = watch::channel(false);

        let supervisor = tokio::spawn(supervise(
            config.clone(),
            Arc::clone(&shared),
            listener,
            channel,
            incoming_tx,
            stop_rx,
        ));

        Self {
            config,
            shared,
            local_addr,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            stop,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    /// Enqueue a command. Never blocks on the socket.
    ///
    /// Returns the sequence number assigned to it.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` unless the session is active.
    pub fn send(&self, command: Command) -> Result<u64> {
        self.send_message(command.into_message())
    }

    /// Enqueue a prebuilt message (response, event, ...).
    ///
    /// A message without `seq` gets the next sequence number.
    pub fn send_message(&self, message: Message) -> Result<u64> {
        let outbox = self.shared.outbox().ok_or(CrossfireError::NotConnected)?;
        outbox.send(message).map_err(|e| match e {
            CrossfireError::ConnectionClosed => CrossfireError::NotConnected,
            other => other,
        })
    }

    /// Take the next received message without waiting.
    pub fn receive(&self) -> Option<Message> {
        let mut incoming = self.incoming.try_lock().ok()?;
        incoming.try_recv().ok()
    }

    /// Wait for the next received message.
    ///
    /// Returns `None` once the session is closed and every received
    /// message has been taken.
    pub async fn recv(&self) -> Option<Message> {
        self.incoming.lock().await.recv().await
    }

    /// Close the session.
    ///
    /// Announces `closed` to the peer when configured, then stops the
    /// supervisor and the channel with the bounded join. Calling it again
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if the supervisor had to be aborted.
    pub async fn close(&self) -> Result<()> {
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut handle) = handle else {
            return Ok(());
        };

        if self.config.announce_close {
            if let Some(outbox) = self.shared.outbox() {
                let closed = Message::event(CLOSED_EVENT, None, Map::new());
                if let Err(e) = outbox.send(closed) {
                    tracing::debug!("Could not announce close: {}", e);
                }
            }
        }

        self.stop.send_replace(true);

        // the supervisor itself waits up to shutdown_timeout for the channel
        let window = self.config.shutdown_timeout + self.config.shutdown_timeout;
        if tokio::time::timeout(window, &mut handle).await.is_err() {
            handle.abort();
            self.shared.detach();
            self.shared.set_state(SessionState::Closed);
            tracing::warn!("Session supervisor did not stop within {:?}, aborted", window);
            return Err(CrossfireError::ShutdownTimeout);
        }

        tracing::info!("Session closed");
        Ok(())
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Current status, using the wire-compatible names.
    pub fn status(&self) -> ConnectionStatus {
        self.state().status(self.shared.role)
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the session reaches `state`.
    pub async fn wait_for_state(&self, state: SessionState) -> Result<()> {
        let mut rx = self.subscribe();
        rx.wait_for(|s| *s == state)
            .await
            .map(|_| ())
            .map_err(|_| CrossfireError::ConnectionClosed)
    }

    /// Our role.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Tools acknowledged on the current connection.
    pub fn tools(&self) -> Vec<String> {
        read(&self.shared.tools).clone()
    }

    /// Why the most recent connection ended.
    pub fn last_exit(&self) -> Option<ChannelExit> {
        read(&self.shared.last_exit).clone()
    }

    /// Address of the current peer.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *read(&self.shared.peer_addr)
    }

    /// Listening address (server role).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of times the server accepted a new peer after the first.
    pub fn restarts(&self) -> u64 {
        self.shared.restarts.load(Ordering::Relaxed)
    }

    /// Highest sequence number seen from the current peer.
    pub fn last_seen_seq(&self) -> Option<u64> {
        self.shared.correlator.last_seen()
    }
}

/// Run the handshake on a fresh connection and start its channel.
///
/// The caller moves the session to `Active`.
async fn establish(
    mut conn: Connection,
    config: &SessionConfig,
    shared: &Shared,
    incoming: &mpsc::UnboundedSender<Message>,
) -> Result<DuplexChannel> {
    shared.set_state(SessionState::Handshaking);
    let tools = conn.handshake(&config.tools, config.handshake_timeout).await?;
    let peer = conn.peer_addr();
    let (reader, writer) = conn.into_split()?;

    shared.correlator.reset_peer();
    let channel = DuplexChannel::spawn(
        reader,
        writer,
        Arc::clone(&shared.correlator),
        incoming.clone(),
        config.channel_config(),
    );

    shared.attach(channel.outbox(), tools, peer);
    tracing::info!("Connection established with {}", peer);
    Ok(channel)
}

async fn accept_peer(
    listener: &Listener,
    config: &SessionConfig,
    shared: &Shared,
    incoming: &mpsc::UnboundedSender<Message>,
) -> Result<DuplexChannel> {
    shared.set_state(SessionState::Listening);
    let conn = listener.accept().await?;
    establish(conn, config, shared, incoming).await
}

/// Supervisor loop - watches the channel and restarts the server side.
async fn supervise(
    config: SessionConfig,
    shared: Arc<Shared>,
    listener: Option<Listener>,
    mut channel: DuplexChannel,
    incoming: mpsc::UnboundedSender<Message>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let stopped = tokio::select! {
            _ = channel.closed() => false,
            _ = stop.wait_for(|stopped| *stopped) => true,
        };

        shared.detach();
        let exit = match channel.shutdown(config.shutdown_timeout).await {
            Ok(exit) => exit,
            Err(e) => {
                tracing::warn!("Channel shutdown: {}", e);
                ChannelExit::Failed(e.to_string())
            }
        };
        tracing::info!("Connection ended: {}", exit);
        *write(&shared.last_exit) = Some(exit);
        shared.set_state(SessionState::Closed);

        if stopped || !config.restarts_enabled() {
            return;
        }
        let Some(listener) = listener.as_ref() else {
            return;
        };

        channel = loop {
            let accepted = tokio::select! {
                accepted = accept_peer(listener, &config, &shared, &incoming) => Some(accepted),
                _ = stop.wait_for(|stopped| *stopped) => None,
            };

            match accepted {
                Some(Ok(channel)) => break channel,
                Some(Err(e)) => {
                    tracing::warn!("Restart attempt failed: {}", e);
                    shared.set_state(SessionState::Closed);
                    if !e.is_handshake_failure() {
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
                None => {
                    shared.set_state(SessionState::Closed);
                    return;
                }
            }
        };

        let restarts = shared.restarts.fetch_add(1, Ordering::Relaxed) + 1;
        shared.set_state(SessionState::Active);
        tracing::info!("Server restarted ({} restarts)", restarts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.role, Role::Server);
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.read_timeout, None);
        assert_eq!(config.first_sequence, 1);
        assert!(config.auto_restart);
        assert!(config.announce_close);
        assert!(config.tools.is_empty());
    }

    #[test]
    fn test_builder_configuration() {
        let config = Session::builder_client()
            .host("localhost")
            .port(6000)
            .handshake_timeout(Duration::from_secs(3))
            .read_timeout(Duration::from_secs(30))
            .shutdown_timeout(Duration::from_secs(1))
            .tool("console")
            .tool("net")
            .auto_restart(false)
            .first_sequence(0)
            .max_content_length(1024)
            .announce_close(false)
            .config();

        assert_eq!(config.role, Role::Client);
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 6000);
        assert_eq!(config.read_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.tools, vec!["console", "net"]);
        assert_eq!(config.first_sequence, 0);
        assert_eq!(config.max_content_length, 1024);
        assert!(!config.auto_restart);
        assert!(!config.announce_close);
    }

    #[test]
    fn test_tools_replaces_list() {
        let config = Session::builder_server()
            .tool("dom")
            .tools(["console", "inspector"])
            .config();
        assert_eq!(config.tools, vec!["console", "inspector"]);
    }

    #[test]
    fn test_restarts_only_for_server() {
        assert!(SessionConfig::new(Role::Server).restarts_enabled());
        assert!(!SessionConfig::new(Role::Client).restarts_enabled());

        let mut config = SessionConfig::new(Role::Server);
        config.auto_restart = false;
        assert!(!config.restarts_enabled());
    }

    #[test]
    fn test_status_names() {
        assert_eq!(SessionState::Idle.status(Role::Server).as_str(), "disconnected");
        assert_eq!(SessionState::Listening.status(Role::Server).as_str(), "wait_server");
        assert_eq!(SessionState::Connecting.status(Role::Client).as_str(), "connecting");
        assert_eq!(SessionState::Handshaking.status(Role::Server).as_str(), "connecting");
        assert_eq!(SessionState::Active.status(Role::Server).as_str(), "connected_server");
        assert_eq!(SessionState::Active.status(Role::Client).as_str(), "connected_client");
        assert_eq!(SessionState::Closed.status(Role::Client).to_string(), "disconnected");
    }

    #[tokio::test]
    async fn test_client_open_without_server_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = Session::builder_client().port(port).open().await;
        assert!(matches!(result, Err(CrossfireError::Io(_))));
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let listener = Session::builder_server().port(0).bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(listener.shared.state(), SessionState::Listening);
    }

    #[tokio::test]
    async fn test_client_server_sessions() {
        let listener = Session::builder_server()
            .port(0)
            .tools(["console", "dom"])
            .bind()
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();

        let (server, client) = tokio::join!(
            listener.accept(),
            Session::builder_client()
                .port(port)
                .tools(["console", "net"])
                .open()
        );
        let server = server.unwrap();
        let client = client.unwrap();

        assert_eq!(server.status(), ConnectionStatus::ConnectedServer);
        assert_eq!(client.status(), ConnectionStatus::ConnectedClient);
        assert_eq!(client.tools(), vec!["console"]);
        assert_eq!(server.tools(), vec!["console"]);

        let seq = client.send(Command::new("", "version")).unwrap();
        assert_eq!(seq, 1);

        let request = server.recv().await.unwrap();
        assert_eq!(request.command.as_deref(), Some("version"));
        assert_eq!(request.seq, Some(1));

        let reply = Message::response("version", 1, None, serde_json::json!({"version": "0.3"}), true, true);
        server.send_message(reply).unwrap();

        let response = client.recv().await.unwrap();
        assert_eq!(response.request_seq(), Some(1));

        client.close().await.unwrap();
        assert_eq!(client.state(), SessionState::Closed);
        assert!(matches!(
            client.send(Command::new("", "version")),
            Err(CrossfireError::NotConnected)
        ));

        // the server saw the announced close and went back to listening
        let closed = server.recv().await.unwrap();
        assert!(closed.is_closed_event());
        server.wait_for_state(SessionState::Listening).await.unwrap();

        server.close().await.unwrap();
        assert_eq!(server.state(), SessionState::Closed);
    }
}
