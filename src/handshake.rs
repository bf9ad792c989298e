//! Connection handshake.
//!
//! Before any framed traffic both sides exchange a fixed greeting:
//!
//! ```text
//! client -> server:  CrossfireHandshake\r\n[console,net\r\n]
//! server -> client:  CrossfireHandshake\r\n[console,net\r\n]
//! ```
//!
//! The optional second line lists the tools the client wants enabled; the
//! server may answer with the subset it acknowledges. Servers without tool
//! support echo only the greeting, in which case no tools are acknowledged.
//! A server that sees a wrong greeting closes without replying.
//!
//! # Example
//!
//! ```ignore
//! use crossfire_wire::handshake::Handshake;
//!
//! let mut handshake = Handshake::client(vec!["console".into()]);
//! let tools = handshake.perform(&mut reader, &mut writer, timeout).await?;
//! ```

use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CrossfireError, Result};
use crate::protocol::{looks_like_header, CONTENT_LENGTH, MAX_HEADER_LINE};

/// The greeting both sides exchange.
pub const GREETING: &[u8] = b"CrossfireHandshake\r\n";

/// How long the server waits for the optional tool line after the greeting.
pub const TOOLS_GRACE: Duration = Duration::from_millis(50);

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Debuggee side: accepts a peer and waits for its greeting.
    Server,
    /// Debugger side: connects out and greets first.
    Client,
}

/// Handshake progress of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Socket open, nothing exchanged.
    Pending,
    /// Greeting exchange in flight.
    Negotiating,
    /// Greeting exchanged; framed traffic allowed.
    Established,
    /// Exchange failed or connection torn down.
    Closed,
}

/// Greeting exchange for one connection.
#[derive(Debug)]
pub struct Handshake {
    role: Role,
    /// Client: requested tools. Server: supported tools (empty = any).
    tools: Vec<String>,
    state: HandshakeState,
}

impl Handshake {
    /// Create a handshake for the given role.
    pub fn new(role: Role, tools: Vec<String>) -> Self {
        Self {
            role,
            tools,
            state: HandshakeState::Pending,
        }
    }

    /// Server handshake acknowledging any of `supported` (empty = all).
    pub fn server(supported: Vec<String>) -> Self {
        Self::new(Role::Server, supported)
    }

    /// Client handshake requesting `tools`.
    pub fn client(tools: Vec<String>) -> Self {
        Self::new(Role::Client, tools)
    }

    /// Our role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Run the exchange, bounded by `timeout`.
    ///
    /// Returns the acknowledged tools.
    ///
    /// # Errors
    ///
    /// - `HandshakeTimeout` if the exchange does not finish in time
    /// - `Handshake` on a wrong greeting or an I/O failure
    pub async fn perform<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        timeout: Duration,
    ) -> Result<Vec<String>>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if self.state != HandshakeState::Pending {
            return Err(CrossfireError::Handshake(format!(
                "handshake already in state {:?}",
                self.state
            )));
        }
        self.state = HandshakeState::Negotiating;

        let result = match self.role {
            Role::Server => {
                tokio::time::timeout(timeout, server_exchange(reader, writer, &self.tools)).await
            }
            Role::Client => {
                tokio::time::timeout(timeout, client_exchange(reader, writer, &self.tools)).await
            }
        }
        .unwrap_or_else(|_| Err(CrossfireError::HandshakeTimeout));

        match &result {
            Ok(tools) => {
                self.state = HandshakeState::Established;
                tracing::debug!("Handshake established ({:?}), tools: {:?}", self.role, tools);
            }
            Err(e) => {
                self.state = HandshakeState::Closed;
                tracing::warn!("Handshake failed ({:?}): {}", self.role, e);
            }
        }
        result
    }
}

async fn server_exchange<R, W>(reader: &mut R, writer: &mut W, supported: &[String]) -> Result<Vec<String>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut greeting = [0u8; GREETING.len()];
    reader
        .read_exact(&mut greeting)
        .await
        .map_err(handshake_io)?;
    if greeting != GREETING {
        return Err(CrossfireError::Handshake(format!(
            "unexpected greeting {:?}",
            String::from_utf8_lossy(&greeting)
        )));
    }

    let requested = if has_tool_line(reader).await? {
        parse_tool_list(&read_line(reader).await?)
    } else {
        Vec::new()
    };

    let mut reply = GREETING.to_vec();
    if !requested.is_empty() {
        let acknowledged: Vec<String> = requested
            .into_iter()
            .filter(|t| supported.is_empty() || supported.contains(t))
            .collect();
        reply.extend_from_slice(format_tool_list(&acknowledged).as_bytes());
        write_reply(writer, &reply).await?;
        return Ok(acknowledged);
    }

    write_reply(writer, &reply).await?;
    Ok(Vec::new())
}

async fn client_exchange<R, W>(reader: &mut R, writer: &mut W, requested: &[String]) -> Result<Vec<String>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut hello = GREETING.to_vec();
    if !requested.is_empty() {
        hello.extend_from_slice(format_tool_list(requested).as_bytes());
    }
    write_reply(writer, &hello).await?;

    let mut echo = [0u8; GREETING.len()];
    reader.read_exact(&mut echo).await.map_err(handshake_io)?;
    if echo != GREETING {
        return Err(CrossfireError::Handshake(format!(
            "unexpected greeting echo {:?}",
            String::from_utf8_lossy(&echo)
        )));
    }

    // the acknowledgement line is optional; plain servers echo the bare greeting
    if requested.is_empty() || !has_tool_line(reader).await? {
        return Ok(Vec::new());
    }
    Ok(parse_tool_list(&read_line(reader).await?))
}

/// Wait briefly for bytes after the greeting and check whether they start
/// a tool line rather than the first frame.
///
/// Anything that is, or may still become, a header line is left buffered.
async fn has_tool_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<bool> {
    let buf = match tokio::time::timeout(TOOLS_GRACE, reader.fill_buf()).await {
        Ok(result) => result.map_err(handshake_io)?,
        Err(_) => return Ok(false),
    };
    Ok(is_tool_line(buf))
}

/// Whether buffered bytes after the greeting hold a tool list.
fn is_tool_line(buf: &[u8]) -> bool {
    if buf.is_empty() {
        return false;
    }

    let marker = CONTENT_LENGTH.as_bytes();
    let n = buf.len().min(marker.len());
    if buf[..n] == marker[..n] {
        return false;
    }

    let line = match buf.iter().position(|&b| b == b'\n') {
        Some(end) => &buf[..end],
        None => buf,
    };
    !looks_like_header(line)
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    let n = (&mut *reader)
        .take(MAX_HEADER_LINE as u64)
        .read_until(b'\n', &mut line)
        .await
        .map_err(handshake_io)?;
    if n == 0 || !line.ends_with(b"\n") {
        return Err(CrossfireError::Handshake(
            "tool line not terminated".to_string(),
        ));
    }
    Ok(line)
}

async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer.write_all(bytes).await.map_err(handshake_io)?;
    writer.flush().await.map_err(handshake_io)?;
    Ok(())
}

fn handshake_io(e: std::io::Error) -> CrossfireError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        CrossfireError::Handshake("peer closed the connection during handshake".to_string())
    } else {
        CrossfireError::Handshake(format!("I/O error: {}", e))
    }
}

/// Parse a comma-separated tool line. Empty names are dropped.
pub fn parse_tool_list(line: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(line)
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Format tools as a terminated comma-separated line.
pub fn format_tool_list(tools: &[String]) -> String {
    format!("{}\r\n", tools.join(","))
}
