//! Porthole unified CLI
//!
//! Self-hosted reverse TCP tunneling: expose a service on a private network
//! through a publicly reachable server.

// Use mimalloc as the global allocator for better relay performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "porthole",
    author,
    version,
    about = "Self-hosted reverse TCP tunnel",
    long_about = "Porthole exposes a service on a private network through a publicly\n\
                  reachable server: one control connection, one fresh public port,\n\
                  byte-exact TCP relay in both directions.",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel server
    Server(commands::server::ServerArgs),

    /// Run the tunnel client
    Client(commands::client::ClientArgs),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    // rustls refuses to build configs without a process-default provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    match cli.command {
        Commands::Server(args) => commands::server::run(args).await,
        Commands::Client(args) => commands::client::run(args).await,
        Commands::Version => {
            commands::version::run();
            Ok(())
        }
    }
}

fn init_logging() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
