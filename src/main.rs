//! Multichat Server - Entry Point
//!
//! Loads the configuration, binds the listener and serves until Ctrl-C.

use std::env;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use multichat::{serve, ChatServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=multichat=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("multichat=info")),
        )
        .init();

    let mut config = ServerConfig::from_env()?;

    // Bind address from command line wins over CHAT_ADDR
    if let Some(addr) = env::args().nth(1) {
        config.addr = addr;
    }

    let listener = TcpListener::bind(&config.addr).await?;
    let local = listener.local_addr()?;
    info!("Chat server listening on {}", local);
    info!("    Connect with:  telnet {} {}", local.ip(), local.port());
    info!("    or browse to:  http://{}/", local);

    let server = Arc::new(ChatServer::new(config));

    tokio::select! {
        _ = serve(listener, server) => {}
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutting down");
        }
    }

    Ok(())
}
