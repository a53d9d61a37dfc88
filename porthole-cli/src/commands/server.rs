//! Server subcommand implementation

use anyhow::{bail, Result};
use clap::Args;
use porthole_common::constants::{DEFAULT_CONTROL_BIND, DEFAULT_START_PORT};
use porthole_core::auth::SharedToken;
use porthole_core::TunnelServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Address to bind the tunnel control channel to
    #[arg(long, default_value = DEFAULT_CONTROL_BIND, env = "PORTHOLE_ADDR")]
    addr: SocketAddr,

    /// Starting port for public listeners
    #[arg(long, default_value_t = DEFAULT_START_PORT, env = "PORTHOLE_START_PORT")]
    start_port: u16,

    /// Require this exact token from clients (compared in constant time).
    /// Without it, any non-empty token is accepted.
    #[arg(long, env = "PORTHOLE_TOKEN")]
    token: Option<String>,

    /// Enable TLS on the control channel
    #[arg(long, env = "PORTHOLE_TLS")]
    tls: bool,

    /// Path to TLS certificate (PEM format)
    #[arg(long, default_value = "certs/server-cert.pem", env = "PORTHOLE_TLS_CERT")]
    tls_cert: PathBuf,

    /// Path to TLS private key (PEM format)
    #[arg(long, default_value = "certs/server-key.pem", env = "PORTHOLE_TLS_KEY")]
    tls_key: PathBuf,
}

pub async fn run(args: ServerArgs) -> Result<()> {
    info!("starting Porthole server v{}", env!("CARGO_PKG_VERSION"));

    let mut server = TunnelServer::new(args.addr).with_start_port(args.start_port);

    if args.tls {
        if !args.tls_cert.is_file() {
            bail!("TLS certificate not found: {}", args.tls_cert.display());
        }
        if !args.tls_key.is_file() {
            bail!("TLS private key not found: {}", args.tls_key.display());
        }
        info!("TLS enabled (cert {})", args.tls_cert.display());
        server = server.with_tls(
            args.tls_cert.to_string_lossy(),
            args.tls_key.to_string_lossy(),
        );
    }

    if let Some(token) = args.token {
        server = server.with_token_validator(Arc::new(SharedToken::new(token)));
    }

    super::cancel_on_signals(server.cancel_token());

    info!(
        "public ports start at {} — press Ctrl-C to stop",
        args.start_port
    );
    server.run().await?;
    info!("shutdown complete");
    Ok(())
}
