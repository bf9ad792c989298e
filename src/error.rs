//! Error types for crossfire-wire.
//!
//! Every error here is local to one connection: none of them is meant to
//! take the process down. The session controller turns them into a terminal
//! state transition plus a reported reason.

use thiserror::Error;

/// Main error type for all Crossfire transport operations.
#[derive(Debug, Error)]
pub enum CrossfireError {
    /// Socket-level I/O failure on send or receive.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error while encoding an outgoing message.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The greeting exchange failed (mismatch, short read, peer hung up).
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The greeting exchange did not finish within the handshake timeout.
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// Malformed frame header or body.
    #[error("Frame decode error: {0}")]
    FrameDecode(String),

    /// An outgoing message cannot be put on the wire as given.
    #[error("Frame encode error: {0}")]
    FrameEncode(String),

    /// The peer closed the connection or the channel queues are gone.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The operation needs an established connection.
    #[error("Not connected")]
    NotConnected,

    /// Channel loops did not exit within the bounded join window.
    #[error("Shutdown timed out")]
    ShutdownTimeout,
}

impl CrossfireError {
    /// Whether this error happened before the connection reached the
    /// established state.
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            CrossfireError::Handshake(_) | CrossfireError::HandshakeTimeout
        )
    }
}

/// Result type alias using CrossfireError.
pub type Result<T> = std::result::Result<T, CrossfireError>;
