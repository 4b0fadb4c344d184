//! Tether HTTP host.
//!
//! Serves the two wire endpoints (`POST /push`, `POST /pull`) backed by a
//! `ServerEngine`, with a header-based demo authenticator. Application
//! handlers are registered where the engine is built; out of the box only
//! the built-in `Echo` method is available.

mod handler;
mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{EngineConfig, ServerEngine};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "tether-server")]
#[command(about = "HTTP host for the tether RPC engine")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Long-poll window in milliseconds
    #[arg(long)]
    long_poll_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("starting tether server");

    let mut config = EngineConfig::default();
    if let Some(long_poll_ms) = args.long_poll_ms {
        config = config.with_long_poll(Duration::from_millis(long_poll_ms));
    }

    let engine = ServerEngine::new(config, vec![Arc::new(handler::EchoHandler)]);

    let addr = server::start_server(
        engine,
        handler::header_authenticator(),
        &args.host,
        args.port,
    )
    .await?;

    // Printed for supervisors that spawn us with --port 0.
    println!("RPC_PORT={}", addr.port());

    info!("tether server running on {}", addr);

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, exiting");

    Ok(())
}
