//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for buffer management and a small state machine
//! for fragmented frames:
//! - `AwaitingHeaders`: reading header lines until the block ends
//! - `AwaitingBody`: headers parsed, need N more body bytes
//!
//! The end of a header block is detected per frame, so a stream may mix
//! both dialects:
//! - a blank line ends an HTTP-style block;
//! - another `name:value` line continues the block, unless it is a second
//!   `Content-Length` (the next minimal frame already started);
//! - anything else is the first byte of a body that followed a minimal
//!   `Content-Length` line directly.
//!
//! # Example
//!
//! ```
//! use crossfire_wire::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//!
//! // Data arrives in chunks from the socket
//! assert!(buffer.push(b"Content-Length:2\r\n").unwrap().is_empty());
//! let frames = buffer.push(b"\r\n{}").unwrap();
//!
//! assert_eq!(frames.len(), 1);
//! assert!(frames[0].message.body.is_empty());
//! ```

use bytes::{Buf, BytesMut};

use super::headers::{
    is_content_length_line, looks_like_header, parse_header_line, HeaderDialect, HeaderSet,
    CONTENT_LENGTH, CRLF, DEFAULT_MAX_CONTENT_LENGTH, MAX_HEADER_LINE,
};
use super::message::Message;
use crate::error::{CrossfireError, Result};

/// One decoded frame.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// Headers the frame carried.
    pub headers: HeaderSet,
    /// Header layout the frame used.
    pub dialect: HeaderDialect,
    /// Decoded body, with the `tool` header already attached.
    pub message: Message,
}

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Reading header lines; holds the lines read so far.
    AwaitingHeaders { headers: HeaderSet },
    /// Header block complete, waiting for body bytes.
    AwaitingBody {
        headers: HeaderSet,
        dialect: HeaderDialect,
        remaining: usize,
    },
}

impl State {
    fn fresh() -> Self {
        State::AwaitingHeaders {
            headers: HeaderSet::new(),
        }
    }
}

/// Outcome of one extraction attempt.
enum Step {
    /// Not enough buffered bytes to make progress.
    Incomplete,
    /// State advanced without producing a message.
    Progress,
    /// A complete frame.
    Frame(DecodedFrame),
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum accepted `Content-Length`.
    max_content_length: usize,
}

impl FrameBuffer {
    /// Create a new frame buffer with the default body limit.
    pub fn new() -> Self {
        Self::with_max_content_length(DEFAULT_MAX_CONTENT_LENGTH)
    }

    /// Create a new frame buffer with a custom body limit.
    pub fn with_max_content_length(max_content_length: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::fresh(),
            max_content_length,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Returns `FrameDecode` on malformed headers, an oversized or
    /// non-numeric length, or a body that is not valid JSON. The buffer
    /// should not be reused after an error.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<DecodedFrame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            match self.try_extract_one()? {
                Step::Incomplete => break,
                Step::Progress => {}
                Step::Frame(frame) => frames.push(frame),
            }
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Step> {
        match std::mem::replace(&mut self.state, State::fresh()) {
            State::AwaitingHeaders { mut headers } => {
                let Some(dialect) = self.read_header_block(&mut headers)? else {
                    self.state = State::AwaitingHeaders { headers };
                    return Ok(Step::Incomplete);
                };

                let length = headers.content_length()?;
                if length > self.max_content_length {
                    return Err(CrossfireError::FrameDecode(format!(
                        "Content-Length {} exceeds maximum {}",
                        length, self.max_content_length
                    )));
                }

                self.state = State::AwaitingBody {
                    headers,
                    dialect,
                    remaining: length,
                };
                Ok(Step::Progress)
            }

            State::AwaitingBody {
                headers,
                dialect,
                remaining,
            } => {
                if self.buffer.len() < remaining {
                    self.state = State::AwaitingBody {
                        headers,
                        dialect,
                        remaining,
                    };
                    return Ok(Step::Incomplete);
                }

                let body = self.buffer.split_to(remaining).freeze();
                if body.is_empty() {
                    tracing::debug!("Skipping frame with empty body");
                    return Ok(Step::Progress);
                }

                let mut message = Message::from_json_slice(&body)?;
                message.tool = headers.tool().map(str::to_string);

                Ok(Step::Frame(DecodedFrame {
                    headers,
                    dialect,
                    message,
                }))
            }
        }
    }

    /// Read header lines into `headers` until the block ends.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    fn read_header_block(&mut self, headers: &mut HeaderSet) -> Result<Option<HeaderDialect>> {
        loop {
            if headers.is_empty() {
                let Some(pos) = find_crlf(&self.buffer) else {
                    self.check_line_limit()?;
                    return Ok(None);
                };

                if pos == 0 {
                    // stray terminator left over from the previous frame
                    self.buffer.advance(CRLF.len());
                    continue;
                }

                let line = self.buffer.split_to(pos);
                self.buffer.advance(CRLF.len());

                if !looks_like_header(&line) {
                    return Err(CrossfireError::FrameDecode(format!(
                        "expected a header line, got {:?}",
                        String::from_utf8_lossy(&line)
                    )));
                }
                let (name, value) = parse_header_line(&line)?;
                headers.insert(name, value);
                continue;
            }

            let Some(&first) = self.buffer.first() else {
                return Ok(None);
            };

            if first == b'\r' {
                if self.buffer.len() < CRLF.len() {
                    return Ok(None);
                }
                if self.buffer[1] != b'\n' {
                    return Err(CrossfireError::FrameDecode(
                        "stray carriage return in header block".to_string(),
                    ));
                }
                self.buffer.advance(CRLF.len());
                return Ok(Some(HeaderDialect::Http));
            }

            if is_header_name_byte(first) {
                let Some(pos) = find_crlf(&self.buffer) else {
                    self.check_line_limit()?;
                    return Ok(None);
                };

                let line = &self.buffer[..pos];
                if looks_like_header(line) {
                    if headers.contains(CONTENT_LENGTH) && is_content_length_line(line) {
                        // next minimal frame; this one had no separator
                        return Ok(Some(HeaderDialect::Minimal));
                    }
                    let (name, value) = parse_header_line(line)?;
                    self.buffer.advance(pos + CRLF.len());
                    headers.insert(name, value);
                    continue;
                }
            }

            return Ok(Some(HeaderDialect::Minimal));
        }
    }

    fn check_line_limit(&self) -> Result<()> {
        if self.buffer.len() > MAX_HEADER_LINE {
            return Err(CrossfireError::FrameDecode(format!(
                "header line exceeds {} bytes",
                MAX_HEADER_LINE
            )));
        }
        Ok(())
    }

    /// Whether a frame has been started but not finished.
    ///
    /// Leftover line terminators do not count.
    pub fn has_partial_frame(&self) -> bool {
        match &self.state {
            State::AwaitingBody { .. } => true,
            State::AwaitingHeaders { headers } => {
                !headers.is_empty() || self.buffer.iter().any(|b| !matches!(b, b'\r' | b'\n'))
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::fresh();
    }

    /// Get the current state for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::AwaitingHeaders { .. } => "AwaitingHeaders",
            State::AwaitingBody { .. } => "AwaitingBody",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(CRLF.len()).position(|w| w == CRLF)
}

fn is_header_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_frame, Command, MessageType};

    fn http_frame(body: &str, tool: Option<&str>) -> Vec<u8> {
        let mut bytes = format!("Content-Length:{}\r\n", body.len()).into_bytes();
        if let Some(tool) = tool {
            bytes.extend_from_slice(format!("tool:{}\r\n", tool).as_bytes());
        }
        bytes.extend_from_slice(b"\r\n");
        bytes.extend_from_slice(body.as_bytes());
        bytes
    }

    fn minimal_frame(body: &str) -> Vec<u8> {
        format!("Content-Length:{}\r\n{}", body.len(), body).into_bytes()
    }

    #[test]
    fn test_single_http_frame() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer
            .push(&http_frame(r#"{"type":"event","event":"onBreak","seq":3}"#, None))
            .unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].dialect, HeaderDialect::Http);
        assert_eq!(frames[0].message.seq, Some(3));
        assert_eq!(frames[0].message.event.as_deref(), Some("onBreak"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_empty_object_with_trailing_terminator() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(b"Content-Length:2\r\n\r\n{}\r\n").unwrap();

        assert_eq!(frames.len(), 1);
        assert!(frames[0].message.body.is_empty());
        assert!(!buffer.has_partial_frame());

        // the leftover terminator does not disturb the next frame
        let frames = buffer.push(&http_frame(r#"{"seq":4}"#, None)).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message.seq, Some(4));
    }

    #[test]
    fn test_single_minimal_frame() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer
            .push(&minimal_frame(r#"{"type":"request","seq":1,"command":"version"}"#))
            .unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].dialect, HeaderDialect::Minimal);
        assert_eq!(frames[0].message.kind, Some(MessageType::Request));
        assert_eq!(frames[0].message.command.as_deref(), Some("version"));
    }

    #[test]
    fn test_back_to_back_minimal_frames() {
        let mut buffer = FrameBuffer::new();
        let mut data = minimal_frame(r#"{"seq":1}"#);
        data.extend(minimal_frame(r#"{"seq":2}"#));
        data.extend(minimal_frame(r#"{"seq":3}"#));

        let frames = buffer.push(&data).unwrap();
        let seqs: Vec<_> = frames.iter().map(|f| f.message.seq).collect();
        assert_eq!(seqs, vec![Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn test_mixed_dialects() {
        let mut buffer = FrameBuffer::new();
        let mut data = minimal_frame(r#"{"seq":1}"#);
        data.extend(http_frame(r#"{"seq":2}"#, Some("net")));
        data.extend(minimal_frame(r#"{"seq":3}"#));

        let frames = buffer.push(&data).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].dialect, HeaderDialect::Minimal);
        assert_eq!(frames[1].dialect, HeaderDialect::Http);
        assert_eq!(frames[1].message.tool.as_deref(), Some("net"));
        assert_eq!(frames[2].dialect, HeaderDialect::Minimal);
        assert_eq!(frames[2].message.tool, None);
    }

    #[test]
    fn test_tool_header_in_minimal_dialect() {
        let mut buffer = FrameBuffer::new();
        let body = r#"{"seq":8}"#;
        let data = format!("Content-Length:{}\r\ntool:console\r\n{}", body.len(), body);

        let frames = buffer.push(data.as_bytes()).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].dialect, HeaderDialect::Minimal);
        assert_eq!(frames[0].message.tool.as_deref(), Some("console"));
    }

    #[test]
    fn test_tool_header_before_content_length() {
        let mut buffer = FrameBuffer::new();
        let data = b"tool:dom\r\nContent-Length:9\r\n\r\n{\"seq\":2}";

        let frames = buffer.push(data).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message.tool.as_deref(), Some("dom"));
        assert_eq!(frames[0].headers.len(), 2);
    }

    #[test]
    fn test_zero_length_minimal_frame_is_skipped() {
        let mut buffer = FrameBuffer::new();
        let mut data = b"Content-Length:0\r\n".to_vec();
        data.extend(minimal_frame(r#"{"seq":5}"#));

        let frames = buffer.push(&data).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message.seq, Some(5));
    }

    #[test]
    fn test_fragmented_header() {
        let mut buffer = FrameBuffer::new();
        let data = http_frame(r#"{"seq":42}"#, Some("console"));

        let frames = buffer.push(&data[..9]).unwrap();
        assert!(frames.is_empty());
        assert_eq!(buffer.state_name(), "AwaitingHeaders");
        assert!(buffer.has_partial_frame());

        let frames = buffer.push(&data[9..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message.seq, Some(42));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_body() {
        let mut buffer = FrameBuffer::new();
        let body = r#"{"type":"response","seq":10,"command":"scripts","body":{"scripts":[]}}"#;
        let data = http_frame(body, None);
        let split = data.len() - 20;

        let frames = buffer.push(&data[..split]).unwrap();
        assert!(frames.is_empty());
        assert_eq!(buffer.state_name(), "AwaitingBody");

        let frames = buffer.push(&data[split..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message.command.as_deref(), Some("scripts"));
    }

    #[test]
    fn test_minimal_body_without_terminator_completes() {
        let mut buffer = FrameBuffer::new();
        let data = minimal_frame(r#"{"seq":11}"#);

        let (head, tail) = data.split_at(18);
        assert!(buffer.push(head).unwrap().is_empty());
        let frames = buffer.push(tail).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let mut data = http_frame(r#"{"seq":1}"#, Some("net"));
        data.extend(minimal_frame(r#"{"seq":2}"#));

        let mut all_frames = Vec::new();
        for byte in &data {
            all_frames.extend(buffer.push(&[*byte]).unwrap());
        }

        assert_eq!(all_frames.len(), 2);
        assert_eq!(all_frames[0].message.tool.as_deref(), Some("net"));
        assert_eq!(all_frames[1].message.seq, Some(2));
    }

    #[test]
    fn test_pretty_printed_body() {
        let mut buffer = FrameBuffer::new();
        let body = "{\r\n  \"seq\": 6,\r\n  \"type\": \"event\"\r\n}";
        let frames = buffer.push(&http_frame(body, None)).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message.seq, Some(6));
    }

    #[test]
    fn test_encoder_output_round_trips() {
        let mut msg = Command::new("xf0.1::1", "evaluate")
            .with_argument("expression", "document.title".into())
            .with_tool("debugger")
            .into_message();
        msg.seq = Some(12);

        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&build_frame(&msg).unwrap()).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message, msg);
    }

    #[test]
    fn test_garbage_is_rejected() {
        let mut buffer = FrameBuffer::new();
        let err = buffer.push(b"hello there\r\n").unwrap_err();
        assert!(matches!(err, CrossfireError::FrameDecode(_)));
    }

    #[test]
    fn test_non_numeric_length_is_rejected() {
        let mut buffer = FrameBuffer::new();
        let result = buffer.push(b"Content-Length:abc\r\n\r\n{}");
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_content_length_is_rejected() {
        let mut buffer = FrameBuffer::new();
        let err = buffer.push(b"tool:net\r\n\r\n{}").unwrap_err();
        assert!(err.to_string().contains("missing Content-Length"));
    }

    #[test]
    fn test_invalid_json_body_is_rejected() {
        let mut buffer = FrameBuffer::new();
        let result = buffer.push(b"Content-Length:5\r\n\r\n{nope");
        assert!(matches!(result, Err(CrossfireError::FrameDecode(_))));
    }

    #[test]
    fn test_max_content_length_validation() {
        let mut buffer = FrameBuffer::with_max_content_length(100);
        let result = buffer.push(b"Content-Length:1000\r\n\r\n");

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_endless_header_line_is_rejected() {
        let mut buffer = FrameBuffer::new();
        let junk = vec![b'x'; MAX_HEADER_LINE + 1];
        assert!(buffer.push(&junk).is_err());
    }

    #[test]
    fn test_stray_carriage_return() {
        let mut buffer = FrameBuffer::new();
        let result = buffer.push(b"Content-Length:2\r\n\rX{}");
        assert!(result.is_err());
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = FrameBuffer::new();
        buffer.push(b"Content-Length:10\r\n\r\n{\"se").unwrap();
        assert_eq!(buffer.state_name(), "AwaitingBody");
        assert!(buffer.has_partial_frame());

        buffer.clear();

        assert_eq!(buffer.state_name(), "AwaitingHeaders");
        assert!(buffer.is_empty());
        assert!(!buffer.has_partial_frame());
    }
}
