//! Duet Core - Shared protocol definitions for the duet signaling relay
//!
//! This crate contains the pieces used by both the relay and the call client:
//! the wire codec, error taxonomy, per-connection buffering, the state machine
//! abstraction and configuration. It has no networking code.

pub mod buffer;
pub mod config;
pub mod error;
pub mod fsm;
pub mod protocol;

pub use buffer::{CloseDirective, Outgoing, Reassembly, SendQueue, DEFAULT_MAX_MESSAGE_BYTES};
pub use config::{ClientConfig, Config, ConfigError, SignalConfig};
pub use error::{CloseStatus, ProtocolError};
pub use fsm::{Machine, TransitionError, Transitions};
pub use protocol::{
    validate_token, CandidateShape, DecodeError, IceCandidate, SdpKind, SignalMessage,
    MIN_TOKEN_LEN,
};

/// Default relay port
pub const DEFAULT_PORT: u16 = 8080;
