//! Duet Signal Server
//!
//! WebSocket relay that pairs two registered tokens and forwards their call
//! negotiation traffic.
//!
//! # Usage
//!
//! ```bash
//! # Defaults (0.0.0.0:8080)
//! duet-signal
//!
//! # Explicit config file and overrides
//! duet-signal --config /etc/duet/config.toml --port 9000 --json-logs
//!
//! # Serve wss://
//! duet-signal --cert-file relay.crt --pkey-file relay.key
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use duet_core::Config;
use duet_signal::SignalServer;

#[derive(Parser, Debug)]
#[command(name = "duet-signal")]
#[command(about = "Duet signaling relay for two-party call setup")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to the per-user config path)
    #[arg(short, long, env = "DUET_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Ceiling on unconsumed inbound bytes per connection
    #[arg(long)]
    max_message_bytes: Option<usize>,

    /// PEM certificate chain; enables TLS
    #[arg(long, requires = "pkey_file")]
    cert_file: Option<PathBuf>,

    /// PEM private key (PKCS#8) for the certificate
    #[arg(long, requires = "cert_file")]
    pkey_file: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(filter)
        .with(args.json_logs.then(|| fmt::layer().json()))
        .with((!args.json_logs).then(|| fmt::layer()))
        .init();

    let config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load(),
    };

    let mut signal = config.signal;
    if let Some(bind) = args.bind {
        signal.bind = bind;
    }
    if let Some(port) = args.port {
        signal.port = port;
    }
    if let Some(max) = args.max_message_bytes {
        signal.max_message_bytes = max;
    }
    if let (Some(cert), Some(key)) = (args.cert_file, args.pkey_file) {
        signal.ssl = true;
        signal.cert_file = Some(cert);
        signal.pkey_file = Some(key);
    }

    let addr = SocketAddr::new(signal.bind, signal.port);

    info!("Starting Duet Signal Server");
    info!(
        "Message ceiling {} bytes, connection limit {}",
        signal.max_message_bytes,
        if signal.max_connections == 0 {
            "none".to_string()
        } else {
            signal.max_connections.to_string()
        }
    );

    let server = SignalServer::new(signal);

    tokio::select! {
        result = server.serve(addr) => {
            result.context("signal server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down ({} open connections)", server.session_count());
        }
    }

    Ok(())
}
