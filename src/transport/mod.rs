//! Transport module - TCP socket handling.
//!
//! Provides:
//! - A listener for the debuggee (server) side
//! - An outward connect for the debugger (client) side
//! - A [`Connection`] that owns the socket until its handshake is done

mod tcp;

pub use tcp::{connect, Connection, ConnectionReader, ConnectionWriter, Listener};
