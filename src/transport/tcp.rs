//! TCP connection setup.
//!
//! A [`Connection`] is a live socket plus its handshake state. It can only
//! be split into the halves the duplex channel runs on once the handshake
//! has reached `Established`.
//!
//! # Example
//!
//! ```ignore
//! use crossfire_wire::transport::Listener;
//!
//! let listener = Listener::bind("127.0.0.1", 5000).await?;
//! let mut conn = listener.accept().await?;
//! conn.handshake(&[], timeout).await?;
//! let (reader, writer) = conn.into_split()?;
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{CrossfireError, Result};
use crate::handshake::{Handshake, HandshakeState, Role};

/// Buffered read half. Bytes buffered during the handshake stay here.
pub type ConnectionReader = BufReader<OwnedReadHalf>;

/// Write half.
pub type ConnectionWriter = OwnedWriteHalf;

/// Listening socket for the server role. Stays bound across restarts.
#[derive(Debug)]
pub struct Listener {
    listener: TcpListener,
}

impl Listener {
    /// Bind to `host:port`. Port 0 picks a free port.
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        tracing::info!("Listening on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    /// Accept a single connection.
    pub async fn accept(&self) -> Result<Connection> {
        let (stream, addr) = self.listener.accept().await?;
        tracing::info!("Accepted connection from {}", addr);
        Connection::from_stream(stream, Role::Server)
    }

    /// Get the bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Connect outward to `host:port` (client role).
pub async fn connect(host: &str, port: u16) -> Result<Connection> {
    let stream = TcpStream::connect((host, port)).await?;
    tracing::info!("Connected to {}:{}", host, port);
    Connection::from_stream(stream, Role::Client)
}

/// An open socket and its handshake.
#[derive(Debug)]
pub struct Connection {
    reader: ConnectionReader,
    writer: ConnectionWriter,
    peer_addr: SocketAddr,
    handshake: Option<Handshake>,
    role: Role,
    state: HandshakeState,
    tools: Vec<String>,
}

impl Connection {
    fn from_stream(stream: TcpStream, role: Role) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            peer_addr,
            handshake: None,
            role,
            state: HandshakeState::Pending,
            tools: Vec::new(),
        })
    }

    /// Run the greeting exchange.
    ///
    /// `tools` are the requested tools (client) or the supported tools
    /// (server, empty = all). Returns the acknowledged tools.
    pub async fn handshake(&mut self, tools: &[String], timeout: Duration) -> Result<Vec<String>> {
        let handshake = self
            .handshake
            .get_or_insert_with(|| Handshake::new(self.role, tools.to_vec()));

        let result = handshake
            .perform(&mut self.reader, &mut self.writer, timeout)
            .await;
        self.state = handshake.state();

        let acknowledged = result?;
        self.tools = acknowledged.clone();
        Ok(acknowledged)
    }

    /// Handshake state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Our role on this connection.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Address of the peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Tools acknowledged during the handshake.
    pub fn tools(&self) -> &[String] {
        &self.tools
    }

    /// Split into the halves the duplex channel runs on.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` unless the handshake is established.
    pub fn into_split(self) -> Result<(ConnectionReader, ConnectionWriter)> {
        if self.state != HandshakeState::Established {
            return Err(CrossfireError::NotConnected);
        }
        Ok((self.reader, self.writer))
    }
}
