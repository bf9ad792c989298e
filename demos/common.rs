//! Console front end shared by the demo binaries.
//!
//! Reads commands from stdin as `[tool::]command [json-arguments]` and
//! prints every received message as pretty JSON.

use std::time::Duration;

use clap::Args;
use crossfire_wire::session::{DEFAULT_HOST, DEFAULT_PORT};
use crossfire_wire::{Command, Message, Session, SessionBuilder, SessionState};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Commands the prompt accepts.
pub const COMMANDS: &[&str] = &[
    "entercontext",
    "listcontexts",
    "version",
    "continue",
    "suspend",
    "evaluate",
    "backtrace",
    "frame",
    "scope",
    "scopes",
    "scripts",
    "source",
    "getbreakpoint",
    "getbreakpoints",
    "setbreakpoint",
    "changebreakpoint",
    "clearbreakpoint",
    "inspect",
    "lookup",
];

/// Log to stderr, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Connection options shared by both consoles.
#[derive(Args, Debug)]
pub struct ConnectArgs {
    /// Host to bind (server) or connect to (client)
    #[arg(long, default_value = DEFAULT_HOST)]
    pub host: String,

    /// TCP port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Tools to request (client) or support (server); repeat or comma-separate
    #[arg(short, long = "tool", value_delimiter = ',')]
    pub tools: Vec<String>,

    /// Handshake timeout in seconds
    #[arg(long, default_value_t = 10)]
    pub handshake_timeout: u64,

    /// Abort a connection after this many idle seconds
    #[arg(long)]
    pub read_timeout: Option<u64>,

    /// Bounded join window on shutdown, in seconds
    #[arg(long, default_value_t = 10)]
    pub shutdown_timeout: u64,

    /// Do not send a `closed` event when quitting
    #[arg(long)]
    pub no_announce_close: bool,
}

impl ConnectArgs {
    /// Apply the options to a session builder.
    pub fn apply(&self, builder: SessionBuilder) -> SessionBuilder {
        let builder = builder
            .host(self.host.clone())
            .port(self.port)
            .tools(self.tools.iter().cloned())
            .handshake_timeout(Duration::from_secs(self.handshake_timeout))
            .shutdown_timeout(Duration::from_secs(self.shutdown_timeout))
            .announce_close(!self.no_announce_close);
        match self.read_timeout {
            Some(secs) => builder.read_timeout(Duration::from_secs(secs)),
            None => builder,
        }
    }
}

/// One parsed prompt line.
#[derive(Debug)]
pub enum Input {
    EnterContext(String),
    Send(Command),
}

/// Parse a prompt line against the current context.
pub fn parse_line(line: &str, context: &str) -> Result<Option<Input>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (head, args) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };
    let (tool, name) = match head.split_once("::") {
        Some((tool, name)) => (Some(tool), name),
        None => (None, head),
    };

    if !COMMANDS.contains(&name) {
        return Err(format!("Unknown command: {}", name));
    }
    if name == "entercontext" {
        return Ok(Some(Input::EnterContext(args.to_string())));
    }

    let arguments = if args.is_empty() {
        Map::new()
    } else {
        match serde_json::from_str::<Value>(args) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => return Err("Failed to parse arguments.".to_string()),
        }
    };

    let mut command = Command::new(context, name).with_arguments(arguments);
    if let Some(tool) = tool {
        command = command.with_tool(tool);
    }
    Ok(Some(Input::Send(command)))
}

fn print_message(message: &Message) {
    match serde_json::to_string_pretty(message) {
        Ok(json) => match &message.tool {
            Some(tool) => println!("[{}] {}", tool, json),
            None => println!("{}", json),
        },
        Err(e) => tracing::warn!("Cannot print message: {}", e),
    }
}

fn greet(session: &Session) {
    for name in ["version", "listcontexts"] {
        match session.send(Command::new("", name)) {
            Ok(seq) => tracing::info!("Sent {} (seq {})", name, seq),
            Err(e) => tracing::warn!("Cannot send {}: {}", name, e),
        }
    }
}

/// Run the prompt until stdin closes or the session ends.
pub async fn run(session: Session) -> crossfire_wire::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut states = session.subscribe();
    let mut context = String::new();

    greet(&session);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                match parse_line(&line, &context) {
                    Ok(Some(Input::EnterContext(id))) => {
                        println!("Entering context: {}", id);
                        context = id;
                    }
                    Ok(Some(Input::Send(command))) => {
                        let name = command.name.clone();
                        match session.send(command) {
                            Ok(seq) => println!("Sending command => {} (seq {})", name, seq),
                            Err(e) => println!("Cannot send {}: {}", name, e),
                        }
                    }
                    Ok(None) => {}
                    Err(msg) => println!("{}", msg),
                }
            }
            message = session.recv() => {
                let Some(message) = message else { break };
                print_message(&message);
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                tracing::info!("Status: {}", session.status());
                if state == SessionState::Active && session.restarts() > 0 {
                    greet(&session);
                }
            }
        }
    }

    session.close().await
}
