//! Protocol module - messages, header blocks, and framing.
//!
//! This module implements the Crossfire wire format:
//! - JSON message envelope and outgoing commands
//! - `Content-Length` header block in both dialects
//! - Frame encoding for the writer side
//! - Frame buffer for accumulating partial reads

mod frame;
mod frame_buffer;
mod headers;
mod message;

pub use frame::{build_frame, encode_header_block, OutboundFrame};
pub use frame_buffer::{DecodedFrame, FrameBuffer};
pub use headers::{
    is_content_length_line, looks_like_header, parse_header_line, HeaderDialect, HeaderSet,
    CONTENT_LENGTH, CRLF, DEFAULT_MAX_CONTENT_LENGTH, MAX_HEADER_LINE, TOOL_HEADER,
};
pub use message::{Command, Message, MessageType, CLOSED_EVENT};
