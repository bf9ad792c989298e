//! Crossfire client console.
//!
//! Connects to a listening Crossfire endpoint and drives it from stdin.
//!
//! Run with: cargo run --example crossfire_client -- --port 5000 --tool console

mod common;

use clap::Parser;
use crossfire_wire::Session;

#[derive(Parser, Debug)]
#[command(name = "crossfire_client")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    connect: common::ConnectArgs,
}

#[tokio::main]
async fn main() -> crossfire_wire::Result<()> {
    let cli = Cli::parse();
    common::init_tracing();

    let session = cli.connect.apply(Session::builder_client()).open().await?;
    tracing::info!(tools = ?session.tools(), "Connected ({})", session.status());

    common::run(session).await
}
