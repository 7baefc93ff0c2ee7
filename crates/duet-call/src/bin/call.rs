//! Duet Call
//!
//! Command-line participant for the duet relay. Registers a token, optionally
//! calls another token and logs the negotiation.
//!
//! # Usage
//!
//! ```bash
//! # Wait for an incoming call
//! duet-call --token callee_123456789
//!
//! # Call someone and offer a session description read from a file
//! duet-call --token caller_123456789 --call callee_123456789 --sdp-file offer.sdp
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use duet_call::{CallClient, ClientError, SdpKind, SignalHandler, Signaler};
use duet_core::Config;

#[derive(Parser, Debug)]
#[command(name = "duet-call")]
#[command(about = "Register with a duet relay and set up a call")]
#[command(version)]
struct Args {
    /// Token to register (at least 10 characters)
    #[arg(short, long, env = "DUET_TOKEN")]
    token: String,

    /// Token to call once registered
    #[arg(short, long)]
    call: Option<String>,

    /// Session description to send: as an offer when calling, as the
    /// answer to an incoming offer otherwise
    #[arg(long)]
    sdp_file: Option<PathBuf>,

    /// Configuration file (defaults to the per-user config path)
    #[arg(long, env = "DUET_CONFIG")]
    config: Option<PathBuf>,

    /// Relay host
    #[arg(long)]
    host: Option<String>,

    /// Relay port
    #[arg(short, long)]
    port: Option<u16>,

    /// Connect with TLS (wss://)
    #[arg(long)]
    ssl: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

/// Logs every event and answers with the configured description
struct CliHandler {
    sdp: Option<String>,
    signaler: Option<Signaler>,
    done: mpsc::UnboundedSender<String>,
}

impl CliHandler {
    fn send_sdp(&self, kind: SdpKind) {
        let (Some(sdp), Some(signaler)) = (&self.sdp, &self.signaler) else {
            return;
        };
        match signaler.send_sdp(kind, sdp) {
            Ok(()) => info!("Sent {} ({} bytes)", kind.as_str(), sdp.len()),
            Err(e) => warn!("Failed to send {}: {}", kind.as_str(), e),
        }
    }
}

impl SignalHandler for CliHandler {
    fn on_registered(&mut self, signaler: Signaler) {
        info!("Registered with relay");
        self.signaler = Some(signaler);
    }

    fn on_call(&mut self, is_caller: bool) {
        if is_caller {
            info!("Call confirmed");
            self.send_sdp(SdpKind::Offer);
        } else {
            info!("Incoming call accepted");
        }
    }

    fn on_sdp(&mut self, is_offer: bool, sdp: &str) -> bool {
        info!(
            "Received {} ({} bytes)",
            if is_offer { "offer" } else { "answer" },
            sdp.len()
        );
        if is_offer {
            self.send_sdp(SdpKind::Answer);
        }
        true
    }

    fn on_ice(&mut self, sdp_mid: &str, sdp_mline_index: i32, candidate: &str) -> bool {
        info!("Received candidate {}:{} {}", sdp_mid, sdp_mline_index, candidate);
        true
    }

    fn on_disconnected(&mut self, reason: &ClientError) {
        let _ = self.done.send(reason.to_string());
    }
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

    let mut client_config = config.client;
    if let Some(host) = args.host {
        client_config.host = host;
    }
    if let Some(port) = args.port {
        client_config.port = port;
    }
    if args.ssl {
        client_config.ssl = true;
    }

    let sdp = match &args.sdp_file {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?,
        ),
        None => None,
    };

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let handler = CliHandler {
        sdp,
        signaler: None,
        done: done_tx,
    };

    let mut client = CallClient::new(client_config, args.token);
    if let Some(target) = args.call {
        client.call_to(target);
    }
    client.start(handler)?;

    tokio::select! {
        reason = done_rx.recv() => {
            info!("Session ended: {}", reason.unwrap_or_default());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted in state {:?}", client.state());
        }
    }

    client.stop().await;
    Ok(())
}
