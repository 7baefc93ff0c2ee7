//! Duet Call - client side of the duet signaling protocol
//!
//! A [`CallClient`] registers a token with the relay, places or accepts a
//! call and carries session descriptions and candidates between its owner
//! and the partner. The owner plugs in through [`SignalHandler`] and sends
//! its own negotiation messages with the [`Signaler`] it receives once
//! registered.
//!
//! The protocol logic lives in [`CallSession`], which does no I/O; the
//! client runs it on a background tokio task.

pub mod client;
pub mod error;
pub mod handler;
pub mod session;
pub mod state;

pub use client::CallClient;
pub use error::ClientError;
pub use handler::{SignalHandler, Signaler};
pub use session::{CallSession, ConnectStep, Step};
pub use state::{CallEvent, CallState};

pub use duet_core::{ClientConfig, SdpKind};
