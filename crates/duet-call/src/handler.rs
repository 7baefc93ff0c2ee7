//! Boundary between a call session and the media layer that owns it

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use duet_core::{CandidateShape, IceCandidate, Machine, SdpKind, SignalMessage};

use crate::error::ClientError;
use crate::state::{CallEvent, StateCell};

/// Callbacks a call session makes into its owner
///
/// All callbacks run on the session's background task. They must return
/// promptly: while one runs, no messages are processed and the no-call
/// timeout is not checked.
pub trait SignalHandler: Send + 'static {
    /// Logged on to the relay. `signaler` sends local descriptions and
    /// candidates to the partner once a call is up.
    fn on_registered(&mut self, signaler: Signaler) {
        let _ = signaler;
    }

    /// A call was set up; `is_caller` is false for an incoming call
    fn on_call(&mut self, is_caller: bool) {
        let _ = is_caller;
    }

    /// Remote session description. Returning false ends the session.
    fn on_sdp(&mut self, is_offer: bool, sdp: &str) -> bool;

    /// Remote connectivity candidate. Returning false ends the session.
    fn on_ice(&mut self, sdp_mid: &str, sdp_mline_index: i32, candidate: &str) -> bool;

    /// The session is over, for whatever reason
    fn on_disconnected(&mut self, reason: &ClientError) {
        let _ = reason;
    }
}

/// Work handed to the background task
#[derive(Debug)]
pub(crate) enum Command {
    /// Encoded message to queue, with the transition it triggers
    Send { payload: Bytes, event: CallEvent },
    Hangup,
}

/// Sends negotiation messages through a running session
///
/// Messages are encoded on the caller's side; the session's background
/// task remains the only writer to the connection. A send the current
/// call state does not allow fails here instead of being queued.
#[derive(Clone, Debug)]
pub struct Signaler {
    tx: mpsc::UnboundedSender<Command>,
    state: Arc<StateCell>,
}

impl Signaler {
    pub(crate) fn channel(state: Arc<StateCell>) -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, state }, rx)
    }

    /// Send a local session description to the partner
    pub fn send_sdp(&self, kind: SdpKind, sdp: &str) -> Result<(), ClientError> {
        let msg = SignalMessage::Sdp {
            kind,
            sdp: sdp.to_string(),
        };
        self.submit(&msg, CallEvent::SdpSent)
    }

    /// Send a local connectivity candidate to the partner
    pub fn send_ice(
        &self,
        sdp_mid: &str,
        sdp_mline_index: i32,
        candidate: &str,
    ) -> Result<(), ClientError> {
        let msg = SignalMessage::Ice(IceCandidate {
            sdp_mid: sdp_mid.to_string(),
            sdp_mline_index,
            candidate: candidate.to_string(),
            shape: CandidateShape::Flat,
        });
        self.submit(&msg, CallEvent::IceSent)
    }

    /// End the call and close the connection
    pub fn hangup(&self) -> Result<(), ClientError> {
        self.tx
            .send(Command::Hangup)
            .map_err(|_| ClientError::NotRunning)
    }

    fn submit(&self, msg: &SignalMessage, event: CallEvent) -> Result<(), ClientError> {
        let from = self.state.load();
        if !Machine::new(from).can_fire(event) {
            return Err(ClientError::Transition { from, event });
        }
        let payload = Bytes::from(msg.encode()?);
        self.tx
            .send(Command::Send { payload, event })
            .map_err(|_| ClientError::NotRunning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::CallState;

    fn in_state(state: CallState) -> (Signaler, mpsc::UnboundedReceiver<Command>) {
        Signaler::channel(Arc::new(StateCell::new(state)))
    }

    #[test]
    fn test_signaler_encodes_eagerly() {
        let (signaler, mut rx) = in_state(CallState::CallConfirmed);
        signaler.send_sdp(SdpKind::Offer, "v=0").unwrap();
        signaler.send_ice("0", 1, "candidate:1").unwrap();
        signaler.hangup().unwrap();

        match rx.try_recv().unwrap() {
            Command::Send { payload, event } => {
                assert_eq!(event, CallEvent::SdpSent);
                assert_eq!(&payload[..], br#"{"type":"offer","sdp":"v=0"}"#);
            }
            other => panic!("unexpected command: {:?}", other),
        }
        match rx.try_recv().unwrap() {
            Command::Send { payload, event } => {
                assert_eq!(event, CallEvent::IceSent);
                assert_eq!(
                    SignalMessage::decode(&payload).unwrap(),
                    SignalMessage::Ice(IceCandidate {
                        sdp_mid: "0".into(),
                        sdp_mline_index: 1,
                        candidate: "candidate:1".into(),
                        shape: CandidateShape::Flat,
                    })
                );
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert!(matches!(rx.try_recv().unwrap(), Command::Hangup));
    }

    #[test]
    fn test_signaler_after_session_ended() {
        let (signaler, rx) = in_state(CallState::SdpNegotiated);
        drop(rx);
        assert!(matches!(
            signaler.send_sdp(SdpKind::Answer, "v=0"),
            Err(ClientError::NotRunning)
        ));
    }

    #[test]
    fn test_send_outside_call_fails() {
        let (signaler, mut rx) = in_state(CallState::Registered);
        match signaler.send_sdp(SdpKind::Offer, "v=0") {
            Err(ClientError::Transition { from, event }) => {
                assert_eq!(from, CallState::Registered);
                assert_eq!(event, CallEvent::SdpSent);
            }
            other => panic!("expected transition error, got {:?}", other),
        }

        let (signaler, _rx2) = in_state(CallState::Stopping);
        assert!(signaler.send_ice("0", 0, "c").is_err());
        assert!(rx.try_recv().is_err());

        // Hanging up is always allowed
        assert!(signaler.hangup().is_ok());
    }
}
