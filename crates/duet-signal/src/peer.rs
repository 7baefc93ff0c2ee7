//! Participant sessions held by the relay

use std::fmt;
use std::time::Instant;

use duet_core::{Machine, Reassembly, SendQueue, Transitions};

/// Opaque handle for one transport connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Relay-side lifecycle of a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    /// Transport is up, no token yet
    Connected,
    /// Logged on and free to be called
    Registered,
    /// Paired; traffic is forwarded verbatim
    Paired,
    /// An error was queued, the connection closes after flushing
    Closing,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    LogonAccepted,
    Paired,
    PartnerLeft,
    Rejected,
    Closed,
}

impl Transitions for PeerState {
    type Event = PeerEvent;

    fn next(self, event: PeerEvent) -> Option<Self> {
        use PeerEvent as E;
        use PeerState as S;

        match (self, event) {
            (S::Connected, E::LogonAccepted) => Some(S::Registered),
            (S::Registered, E::Paired) => Some(S::Paired),
            (S::Paired, E::PartnerLeft) => Some(S::Registered),
            (S::Connected | S::Registered | S::Paired, E::Rejected) => Some(S::Closing),
            (_, E::Closed) => Some(S::Closed),
            _ => None,
        }
    }

    fn is_terminal(self) -> bool {
        self == PeerState::Closed
    }
}

/// One connection known to the router
pub struct Peer {
    pub id: ConnId,
    pub(crate) token: Option<String>,
    pub(crate) partner: Option<ConnId>,
    pub(crate) state: Machine<PeerState>,
    pub(crate) inbound: Reassembly,
    pub(crate) outbound: SendQueue,
    pub connected_at: Instant,
}

impl Peer {
    /// Bare connection shell, no token yet
    pub fn new(id: ConnId, max_message_bytes: usize) -> Self {
        Self {
            id,
            token: None,
            partner: None,
            state: Machine::new(PeerState::Connected),
            inbound: Reassembly::new(max_message_bytes),
            outbound: SendQueue::new(),
            connected_at: Instant::now(),
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn partner(&self) -> Option<ConnId> {
        self.partner
    }

    pub fn state(&self) -> PeerState {
        self.state.state()
    }

    /// Registered, unpaired and not on its way out
    pub fn is_callable(&self) -> bool {
        self.state() == PeerState::Registered && self.partner.is_none()
    }
}
