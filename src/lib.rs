//! # crossfire-wire
//!
//! Rust implementation of both endpoints of the Crossfire remote debugging
//! wire protocol.
//!
//! A connection starts with a fixed greeting exchange and then carries a
//! stream of header-delimited JSON messages in both directions over one TCP
//! socket.
//!
//! ## Architecture
//!
//! - **Handshake**: `CrossfireHandshake\r\n` echo plus optional tool negotiation
//! - **Framing**: `Content-Length` header block followed by a JSON body
//! - **Duplex channel**: one receive loop and one send loop per connection
//! - **Session**: lifecycle, shutdown and server restarts
//!
//! ## Example
//!
//! ```ignore
//! use crossfire_wire::{Command, Session};
//!
//! #[tokio::main]
//! async fn main() -> crossfire_wire::Result<()> {
//!     let session = Session::builder_client().port(5000).open().await?;
//!
//!     session.send(Command::new("", "version"))?;
//!     if let Some(reply) = session.recv().await {
//!         println!("{:?}", reply);
//!     }
//!
//!     session.close().await
//! }
//! ```

pub mod channel;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod sequence;
pub mod session;
pub mod transport;

pub use channel::{ChannelExit, DuplexChannel, Outbox};
pub use error::{CrossfireError, Result};
pub use handshake::{HandshakeState, Role};
pub use protocol::{Command, Message, MessageType};
pub use sequence::SequenceCorrelator;
pub use session::{
    ConnectionStatus, Session, SessionBuilder, SessionConfig, SessionListener, SessionState,
};
