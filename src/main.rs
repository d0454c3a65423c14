//! wsvpn
//!
//! User-space VPN over WebSocket with per-peer AES-GCM encryption.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use wsvpn::{config, VpnClient, VpnServer};

#[derive(Parser)]
#[command(name = "wsvpn")]
#[command(version)]
#[command(about = "User-space VPN tunneling IP packets over WebSocket")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Run as the VPN server instead of a client
    #[arg(short = 'S', long)]
    server: bool,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    log::info!("wsvpn {}", env!("CARGO_PKG_VERSION"));

    let file = config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let options = file
        .into_options(args.server)
        .context("invalid configuration")?;

    let role = async {
        if options.is_server {
            VpnServer::new(options)?.run().await
        } else {
            VpnClient::new(options)?.run().await
        }
    };

    tokio::select! {
        result = role => result.map_err(Into::into),
        _ = shutdown_signal() => {
            log::info!("shutting down");
            Ok(())
        }
    }
}

/// Completes on SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
