//! Decoded protocol messages and outgoing commands.
//!
//! A [`Message`] is one JSON body on the wire. The envelope fields every
//! Crossfire packet shares (`type`, `seq`, `context_id`, `command`, `event`)
//! are typed; everything else (`arguments`, `body`, `request_seq`,
//! `new_context_id`, ...) is kept verbatim in [`Message::body`].
//!
//! # Example
//!
//! ```
//! use crossfire_wire::protocol::{Command, MessageType};
//!
//! let msg = Command::new("xf0.1::1", "backtrace")
//!     .with_argument("fromFrame", 0.into())
//!     .into_message();
//!
//! assert_eq!(msg.kind, Some(MessageType::Request));
//! assert_eq!(msg.command.as_deref(), Some("backtrace"));
//! assert_eq!(msg.body["arguments"]["fromFrame"], 0);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CrossfireError, Result};

/// Event name a peer sends right before it hangs up.
pub const CLOSED_EVENT: &str = "closed";

/// Kind of a Crossfire packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// A command sent to the peer. Older peers label these `"command"`.
    #[serde(alias = "command")]
    Request,
    /// The answer to an earlier request.
    Response,
    /// An asynchronous notification.
    Event,
}

/// A decoded protocol unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Packet kind. Absent in degenerate bodies such as `{}`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageType>,
    /// Sequence number assigned by the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Execution context the packet applies to (may be empty).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    /// Command name (requests and responses).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Event name (events).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    /// All remaining JSON fields, untouched.
    #[serde(flatten)]
    pub body: Map<String, Value>,
    /// Sub-channel tag carried in the `tool` frame header, not in the JSON.
    #[serde(skip)]
    pub tool: Option<String>,
}

impl Message {
    /// Create an empty message of the given kind.
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    /// Build a response packet the way the debuggee side reports results.
    pub fn response(
        command: &str,
        request_seq: u64,
        context_id: Option<&str>,
        body: Value,
        running: bool,
        success: bool,
    ) -> Self {
        let mut msg = Self::new(MessageType::Response);
        msg.command = Some(command.to_string());
        msg.context_id = context_id.map(str::to_string);
        msg.body.insert("request_seq".into(), request_seq.into());
        msg.body.insert("body".into(), body);
        msg.body.insert("running".into(), running.into());
        msg.body.insert("success".into(), success.into());
        msg
    }

    /// Build an event packet. Fields of `data` are merged into the packet.
    pub fn event(name: &str, context_id: Option<&str>, data: Map<String, Value>) -> Self {
        let mut msg = Self::new(MessageType::Event);
        msg.event = Some(name.to_string());
        msg.context_id = context_id.map(str::to_string);
        msg.body = data;
        msg
    }

    /// Set the tool tag.
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    /// Check if this is an event.
    #[inline]
    pub fn is_event(&self) -> bool {
        self.kind == Some(MessageType::Event) || (self.kind.is_none() && self.event.is_some())
    }

    /// Check if this is an event with the given name.
    pub fn is_event_named(&self, name: &str) -> bool {
        self.is_event() && self.event.as_deref() == Some(name)
    }

    /// Check if this is the peer's `closed` notification.
    #[inline]
    pub fn is_closed_event(&self) -> bool {
        self.is_event_named(CLOSED_EVENT)
    }

    /// Sequence number of the request a response answers.
    pub fn request_seq(&self) -> Option<u64> {
        self.body.get("request_seq").and_then(Value::as_u64)
    }

    /// Encode the JSON body (without frame headers).
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a JSON body. The tool tag is left unset.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| CrossfireError::FrameDecode(format!("invalid JSON body: {}", e)))
    }
}

/// An outgoing request, built into a [`Message`] before transmission.
///
/// The sequence number is not part of the command: it is handed out by the
/// connection's sequence correlator when the command is enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Execution context the command targets (empty for global commands).
    pub context_id: String,
    /// Command name, e.g. `version` or `evaluate`.
    pub name: String,
    /// Optional tool the command is routed to.
    pub tool: Option<String>,
    /// Command arguments, sent under the `arguments` key when non-empty.
    pub arguments: Map<String, Value>,
}

impl Command {
    /// Create a command with no arguments.
    pub fn new(context_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            context_id: context_id.into(),
            name: name.into(),
            tool: None,
            arguments: Map::new(),
        }
    }

    /// Route the command to a tool.
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    /// Replace all arguments.
    pub fn with_arguments(mut self, arguments: Map<String, Value>) -> Self {
        self.arguments = arguments;
        self
    }

    /// Add a single argument.
    pub fn with_argument(mut self, key: &str, value: Value) -> Self {
        self.arguments.insert(key.to_string(), value);
        self
    }

    /// Build the request message. `seq` stays unset.
    pub fn into_message(self) -> Message {
        let mut msg = Message::new(MessageType::Request);
        msg.context_id = Some(self.context_id);
        msg.command = Some(self.name);
        msg.tool = self.tool;
        if !self.arguments.is_empty() {
            msg.body
                .insert("arguments".into(), Value::Object(self.arguments));
        }
        msg
    }
}
