//! Outgoing frame encoding.
//!
//! Every frame is written in the HTTP-style dialect:
//!
//! ```text
//! Content-Length:<N>\r\n
//! [tool:<name>\r\n]
//! \r\n
//! <N bytes of JSON>
//! ```
//!
//! # Example
//!
//! ```
//! use crossfire_wire::protocol::{build_frame, Command};
//!
//! let mut msg = Command::new("", "version").into_message();
//! msg.seq = Some(1);
//!
//! let bytes = build_frame(&msg).unwrap();
//! assert!(bytes.starts_with(b"Content-Length:"));
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::headers::{CONTENT_LENGTH, CRLF, TOOL_HEADER};
use super::message::Message;
use crate::error::{CrossfireError, Result};

/// A frame ready to be written: encoded header block plus JSON body.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Header block including the blank separator line.
    pub header: Bytes,
    /// JSON body.
    pub body: Bytes,
}

impl OutboundFrame {
    /// Encode a message into a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be serialized or the tool tag
    /// contains a line break.
    pub fn encode(message: &Message) -> Result<Self> {
        let body = message.to_json_bytes()?;
        let header = encode_header_block(body.len(), message.tool.as_deref())?;
        Ok(Self {
            header,
            body: Bytes::from(body),
        })
    }

    /// Total size of this frame (headers + body).
    #[inline]
    pub fn size(&self) -> usize {
        self.header.len() + self.body.len()
    }

    /// Concatenate header and body into one buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        buf.extend_from_slice(&self.header);
        buf.extend_from_slice(&self.body);
        buf
    }
}

/// Encode the header block for a body of `body_len` bytes.
pub fn encode_header_block(body_len: usize, tool: Option<&str>) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_slice(CONTENT_LENGTH.as_bytes());
    buf.put_u8(b':');
    buf.put_slice(body_len.to_string().as_bytes());
    buf.put_slice(CRLF);

    if let Some(tool) = tool {
        if tool.contains(['\r', '\n']) {
            return Err(CrossfireError::FrameEncode(format!(
                "tool name contains a line break: {:?}",
                tool
            )));
        }
        buf.put_slice(TOOL_HEADER.as_bytes());
        buf.put_u8(b':');
        buf.put_slice(tool.as_bytes());
        buf.put_slice(CRLF);
    }

    buf.put_slice(CRLF);
    Ok(buf.freeze())
}

/// Build a complete frame as a single byte vector.
pub fn build_frame(message: &Message) -> Result<Vec<u8>> {
    Ok(OutboundFrame::encode(message)?.to_vec())
}
