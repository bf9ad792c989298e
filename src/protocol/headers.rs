//! Frame header block.
//!
//! Two header dialects exist in the wild:
//!
//! ```text
//! minimal:  Content-Length:13\r\n{"seq":1,...}
//! http:     Content-Length:13\r\ntool:console\r\n\r\n{"seq":1,...}
//! ```
//!
//! Both are decoded; only the HTTP-style one is ever emitted.

use std::collections::HashMap;

use crate::error::{CrossfireError, Result};

/// Name of the mandatory length header.
pub const CONTENT_LENGTH: &str = "Content-Length";

/// Name of the optional sub-channel header.
pub const TOOL_HEADER: &str = "tool";

/// Line terminator used by every line on the wire.
pub const CRLF: &[u8] = b"\r\n";

/// Longest header line accepted before the stream is declared garbage.
pub const MAX_HEADER_LINE: usize = 8 * 1024;

/// Default cap on a single body (64 MiB).
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 64 * 1024 * 1024;

/// Which header layout a frame used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderDialect {
    /// `Content-Length` line immediately followed by the body.
    Minimal,
    /// Header lines terminated by a blank line.
    Http,
}

/// Parsed headers of one incoming frame.
///
/// Keys are case-sensitive as transmitted. Built fresh per frame and dropped
/// once the body has been read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    headers: HashMap<String, String>,
}

impl HeaderSet {
    /// Create an empty header set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, replacing an earlier value with the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    /// Look a header up by its exact name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Check if a header is present.
    pub fn contains(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    /// The declared body length.
    ///
    /// # Errors
    ///
    /// Returns `FrameDecode` if the header is missing or not a decimal number.
    pub fn content_length(&self) -> Result<usize> {
        let raw = self.get(CONTENT_LENGTH).ok_or_else(|| {
            CrossfireError::FrameDecode("missing Content-Length header".to_string())
        })?;
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CrossfireError::FrameDecode(format!(
                "non-numeric Content-Length: {:?}",
                raw
            )));
        }
        raw.parse::<usize>().map_err(|_| {
            CrossfireError::FrameDecode(format!("Content-Length out of range: {}", raw))
        })
    }

    /// The tool tag, if the frame carried one.
    pub fn tool(&self) -> Option<&str> {
        self.get(TOOL_HEADER).filter(|t| !t.is_empty())
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Check if no header has been read yet.
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

/// Split a header line (without its terminator) at the first colon.
///
/// Surrounding whitespace is stripped from both parts; case is preserved.
pub fn parse_header_line(line: &[u8]) -> Result<(String, String)> {
    let text = std::str::from_utf8(line)
        .map_err(|_| CrossfireError::FrameDecode("header line is not UTF-8".to_string()))?;
    let (name, value) = text.split_once(':').ok_or_else(|| {
        CrossfireError::FrameDecode(format!("header line without colon: {:?}", text))
    })?;
    let name = name.trim();
    if name.is_empty() {
        return Err(CrossfireError::FrameDecode(format!(
            "header line without name: {:?}",
            text
        )));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Check whether a line looks like a `name:value` header.
///
/// Used to tell a continuing HTTP-style header block from a body that
/// follows a minimal `Content-Length` line directly.
pub fn looks_like_header(line: &[u8]) -> bool {
    match line.iter().position(|&b| b == b':') {
        Some(0) | None => false,
        Some(colon) => line[..colon]
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'),
    }
}

/// Check whether a line is a `Content-Length` header.
pub fn is_content_length_line(line: &[u8]) -> bool {
    line.starts_with(CONTENT_LENGTH.as_bytes())
        && line[CONTENT_LENGTH.len()..]
            .iter()
            .find(|b| !b.is_ascii_whitespace())
            == Some(&b':')
}
