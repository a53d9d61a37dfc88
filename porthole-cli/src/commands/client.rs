//! Client subcommand implementation

use anyhow::{bail, Result};
use clap::Args;
use porthole_common::constants::{DEFAULT_SERVER_ADDR, DEFAULT_TOKEN};
use porthole_core::tunnel::TunnelInfo;
use porthole_core::TunnelClient;
use std::path::PathBuf;
use tracing::info;

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Local service to expose (e.g. localhost:3000)
    #[arg(long, env = "PORTHOLE_LOCAL")]
    local: Option<String>,

    /// Tunnel server address
    #[arg(long, default_value = DEFAULT_SERVER_ADDR, env = "PORTHOLE_SERVER")]
    server: String,

    /// Authentication token
    #[arg(long, default_value = DEFAULT_TOKEN, env = "PORTHOLE_TOKEN")]
    token: String,

    /// Connect to the server over TLS
    #[arg(long, env = "PORTHOLE_TLS")]
    tls: bool,

    /// Path to the CA certificate the server's certificate chains to
    #[arg(long, default_value = "certs/ca-cert.pem", env = "PORTHOLE_TLS_CA")]
    tls_ca: PathBuf,

    /// Disable auto-reconnect on connection loss
    #[arg(long)]
    no_reconnect: bool,
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let Some(local_addr) = args.local else {
        bail!("missing --local flag (e.g. --local localhost:3000)");
    };

    info!("starting Porthole client v{}", env!("CARGO_PKG_VERSION"));

    let mut client = TunnelClient::new(args.server.clone(), local_addr.clone())
        .with_token(args.token);

    if args.tls {
        if !args.tls_ca.is_file() {
            bail!("CA certificate not found: {}", args.tls_ca.display());
        }
        client = client.with_tls_ca(args.tls_ca.to_string_lossy());
    }
    if args.no_reconnect {
        client = client.without_reconnect();
    }

    super::cancel_on_signals(client.cancel_token());

    let metrics = client.metrics();
    let server_addr = args.server;
    let reconnect_enabled = !args.no_reconnect;
    let tls_enabled = args.tls;

    let result = client
        .run_with(move |info| {
            print_banner(&server_addr, &local_addr, info, reconnect_enabled, tls_enabled);
        })
        .await;

    println!("{}", metrics.summary());
    result?;
    info!("shutdown complete");
    Ok(())
}

fn print_banner(
    server: &str,
    local_addr: &str,
    info: TunnelInfo,
    reconnect_enabled: bool,
    tls_enabled: bool,
) {
    let reconnect_status = if reconnect_enabled { "enabled" } else { "disabled" };
    let tls_status = if tls_enabled { "enabled ✓" } else { "disabled" };

    println!(
        "\n\
         ╔════════════════════════════════════════════════════════════╗\n\
         ║                  Porthole v{:<8}                        ║\n\
         ║               Self-hosted TCP Tunneling                    ║\n\
         ╚════════════════════════════════════════════════════════════╝\n\
         \n\
         Session Status         online\n\
         Tunnel Server          {server}\n\
         TLS Encryption         {tls_status}\n\
         Auto-Reconnect         {reconnect_status}\n\
         \n\
         Forwarding             tcp://0.0.0.0:{} → {local_addr}\n",
        env!("CARGO_PKG_VERSION"),
        info.public_port,
    );
}
