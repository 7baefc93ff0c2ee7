//! Duet Signal Server
//!
//! Rendezvous relay for two-party calls. Clients connect via WebSocket,
//! register a token and ask to be paired with another token; once paired,
//! everything either side sends is forwarded to the other untouched.
//!
//! # Protocol
//!
//! 1. Each client logs on with `{"type":"logon","token":...}`
//! 2. The caller requests `{"type":"call","to":...}`
//! 3. The callee is told `{"type":"call","from":...}` and the two are paired
//! 4. Session descriptions and candidates flow verbatim between partners
//! 5. When one side leaves, the other receives `{"type":"info","subscriber":"disconnected"}`

pub mod peer;
pub mod router;
pub mod server;

pub use peer::{ConnId, Peer, PeerState};
pub use router::{DataStatus, Router, Transport};
pub use server::{ServerError, SignalServer, WsTransport};

pub use duet_core::DEFAULT_PORT;
