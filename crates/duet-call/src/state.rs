//! Client call-setup states

use std::sync::atomic::{AtomicU8, Ordering};

use duet_core::Transitions;

/// Where one participant stands in setting up a call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CallState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Registering = 3,
    Registered = 4,
    /// Call request sent, or an incoming call was announced
    CallRequested = 5,
    /// The target was offline; a retry is scheduled
    CallPending = 6,
    CallConfirmed = 7,
    SdpNegotiating = 8,
    SdpNegotiated = 9,
    IceNegotiating = 10,
    IceNegotiated = 11,
    Hangup = 12,
    Stopping = 13,
}

impl CallState {
    pub fn from_u8(value: u8) -> Option<Self> {
        use CallState::*;
        Some(match value {
            0 => Disconnected,
            1 => Connecting,
            2 => Connected,
            3 => Registering,
            4 => Registered,
            5 => CallRequested,
            6 => CallPending,
            7 => CallConfirmed,
            8 => SdpNegotiating,
            9 => SdpNegotiated,
            10 => IceNegotiating,
            11 => IceNegotiated,
            12 => Hangup,
            13 => Stopping,
            _ => return None,
        })
    }

    /// Still setting up: subject to the no-call timeout
    pub fn is_setup(self) -> bool {
        matches!(
            self,
            CallState::Connecting
                | CallState::Connected
                | CallState::Registering
                | CallState::Registered
        )
    }

    /// Paired with a partner; negotiation traffic is allowed
    pub fn is_in_call(self) -> bool {
        matches!(
            self,
            CallState::CallRequested
                | CallState::CallConfirmed
                | CallState::SdpNegotiating
                | CallState::SdpNegotiated
                | CallState::IceNegotiating
                | CallState::IceNegotiated
        )
    }
}

/// Inputs that move a [`CallState`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallEvent {
    Connect,
    ConnectFailed,
    Established,
    LogonSent,
    LogonAcked,
    CallRequestSent,
    CallAnnounced,
    CallAccepted,
    CallRejected,
    SdpSent,
    SdpReceived,
    IceSent,
    IceReceived,
    Closed,
    Hangup,
    Stop,
}

impl Transitions for CallState {
    type Event = CallEvent;

    fn next(self, event: CallEvent) -> Option<Self> {
        use CallEvent as E;
        use CallState as S;

        match (self, event) {
            (S::Disconnected | S::Connecting, E::Connect) => Some(S::Connecting),
            (S::Connecting, E::ConnectFailed) => Some(S::Disconnected),
            (S::Connecting, E::Established) => Some(S::Connected),
            (S::Connected, E::LogonSent) => Some(S::Registering),
            (S::Registering, E::LogonAcked) => Some(S::Registered),

            (S::Registered | S::CallPending, E::CallRequestSent) => Some(S::CallRequested),
            (S::Registered | S::CallPending, E::CallAnnounced) => Some(S::CallRequested),
            (S::CallRequested, E::CallAccepted) => Some(S::CallConfirmed),
            (S::CallRequested, E::CallRejected) => Some(S::CallPending),

            (s, E::SdpSent) if s.is_in_call() => Some(S::SdpNegotiating),
            (s, E::SdpReceived) if s.is_in_call() => Some(S::SdpNegotiated),
            (s, E::IceSent) if s.is_in_call() => Some(S::IceNegotiating),
            (s, E::IceReceived) if s.is_in_call() => Some(S::IceNegotiated),

            (_, E::Closed) => Some(S::Disconnected),
            (_, E::Hangup) => Some(S::Hangup),
            (_, E::Stop) => Some(S::Stopping),
            _ => None,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, CallState::Hangup | CallState::Stopping)
    }
}

/// Lock-free view of the current state for readers outside the session
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: CallState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> CallState {
        CallState::from_u8(self.0.load(Ordering::Acquire)).unwrap_or(CallState::Disconnected)
    }

    pub fn store(&self, state: CallState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(CallState::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_core::Machine;

    #[test]
    fn test_u8_round_trip() {
        for v in 0..=13u8 {
            let state = CallState::from_u8(v).unwrap();
            assert_eq!(state as u8, v);
        }
        assert_eq!(CallState::from_u8(14), None);
    }

    #[test]
    fn test_caller_path() {
        let mut m = Machine::new(CallState::Disconnected);
        for ev in [
            CallEvent::Connect,
            CallEvent::Established,
            CallEvent::LogonSent,
            CallEvent::LogonAcked,
            CallEvent::CallRequestSent,
            CallEvent::CallRejected,
            CallEvent::CallRequestSent,
            CallEvent::CallAccepted,
            CallEvent::SdpSent,
            CallEvent::SdpReceived,
            CallEvent::IceSent,
            CallEvent::IceReceived,
        ] {
            m.fire(ev).unwrap();
        }
        assert_eq!(m.state(), CallState::IceNegotiated);
    }

    #[test]
    fn test_callee_path() {
        let mut m = Machine::new(CallState::Registered);
        assert_eq!(m.fire(CallEvent::CallAnnounced), Ok(CallState::CallRequested));
        assert_eq!(m.fire(CallEvent::SdpReceived), Ok(CallState::SdpNegotiated));

        // Someone else may call while our own call waits for a retry
        let mut m = Machine::new(CallState::CallPending);
        assert_eq!(m.fire(CallEvent::CallAnnounced), Ok(CallState::CallRequested));
    }

    #[test]
    fn test_negotiation_requires_call() {
        let mut m = Machine::new(CallState::Registered);
        assert!(m.fire(CallEvent::SdpSent).is_err());
        assert!(m.fire(CallEvent::IceReceived).is_err());

        let mut m = Machine::new(CallState::CallPending);
        assert!(m.fire(CallEvent::SdpReceived).is_err());
    }

    #[test]
    fn test_connect_retry_stays_connecting() {
        let mut m = Machine::new(CallState::Disconnected);
        m.fire(CallEvent::Connect).unwrap();
        assert_eq!(m.fire(CallEvent::Connect), Ok(CallState::Connecting));
        assert_eq!(m.fire(CallEvent::ConnectFailed), Ok(CallState::Disconnected));
    }

    #[test]
    fn test_terminal_states() {
        let mut m = Machine::new(CallState::SdpNegotiated);
        m.fire(CallEvent::Stop).unwrap();
        assert!(m.fire(CallEvent::Stop).is_err());
        assert!(m.fire(CallEvent::Closed).is_err());
        assert_eq!(m.state(), CallState::Stopping);

        let mut m = Machine::new(CallState::Registering);
        m.fire(CallEvent::Hangup).unwrap();
        assert!(m.fire(CallEvent::Closed).is_err());
    }

    #[test]
    fn test_state_cell() {
        let cell = StateCell::default();
        assert_eq!(cell.load(), CallState::Disconnected);
        cell.store(CallState::CallConfirmed);
        assert_eq!(cell.load(), CallState::CallConfirmed);
    }
}
