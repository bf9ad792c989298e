//! Crossfire server console.
//!
//! Listens for a debugger backend, sends `version` and `listcontexts` on
//! every connection and forwards stdin commands. A `closed` event from the
//! peer puts the server back into listening.
//!
//! Run with: cargo run --example crossfire_server -- --port 5000

mod common;

use clap::Parser;
use crossfire_wire::Session;

#[derive(Parser, Debug)]
#[command(name = "crossfire_server")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    connect: common::ConnectArgs,

    /// Exit after the first peer instead of listening again
    #[arg(long)]
    no_restart: bool,
}

#[tokio::main]
async fn main() -> crossfire_wire::Result<()> {
    let cli = Cli::parse();
    common::init_tracing();

    let listener = cli
        .connect
        .apply(Session::builder_server())
        .auto_restart(!cli.no_restart)
        .bind()
        .await?;
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Waiting for Crossfire on {}", addr);
    }

    let session = listener.accept().await?;
    tracing::info!(tools = ?session.tools(), "Connected to {:?}", session.peer_addr());

    common::run(session).await
}
