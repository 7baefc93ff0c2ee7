//! Call-setup core
//!
//! [`CallSession`] holds one participant's view of the signaling protocol
//! and performs no I/O. The background task feeds it transport events and
//! writes what it queues; every wait the protocol asks for comes back as a
//! [`Step`] or [`ConnectStep`] for the task to carry out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use duet_core::protocol::SUBSCRIBER_DISCONNECTED;
use duet_core::{ClientConfig, Machine, Outgoing, Reassembly, SendQueue, SignalMessage};

use crate::error::ClientError;
use crate::handler::{Command, SignalHandler, Signaler};
use crate::state::{CallEvent, CallState, StateCell};

/// What the background task should do next
#[derive(Debug)]
pub enum Step {
    Continue,
    /// Call [`CallSession::retry_call`] after this delay
    RetryCall(Duration),
    /// End the session
    Fatal(ClientError),
}

/// Outcome of a failed connection attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectStep {
    Retry(Duration),
    GiveUp,
}

/// Retry and timeout policy taken from [`ClientConfig`]
#[derive(Clone, Debug)]
struct Policy {
    connect_attempts: u32,
    connect_backoff: Duration,
    call_attempts: u32,
    call_backoff: Duration,
    call_setup_timeout: Duration,
}

impl From<&ClientConfig> for Policy {
    fn from(config: &ClientConfig) -> Self {
        Self {
            connect_attempts: config.connect_attempts.max(1),
            connect_backoff: config.connect_backoff(),
            call_attempts: config.call_attempts,
            call_backoff: config.call_backoff(),
            call_setup_timeout: config.call_setup_timeout(),
        }
    }
}

pub struct CallSession {
    token: String,
    target: Option<String>,
    partner: Option<String>,
    machine: Machine<CallState>,
    published: Arc<StateCell>,
    policy: Policy,
    connect_attempts: u32,
    call_attempts: u32,
    call_outstanding: bool,
    inbound: Reassembly,
    outbound: SendQueue,
    started_at: Option<Instant>,
    handler: Box<dyn SignalHandler>,
    signaler: Signaler,
    finished: bool,
}

impl CallSession {
    pub(crate) fn new(
        config: &ClientConfig,
        token: String,
        target: Option<String>,
        handler: Box<dyn SignalHandler>,
        signaler: Signaler,
        published: Arc<StateCell>,
    ) -> Self {
        published.store(CallState::Disconnected);
        Self {
            token,
            target,
            partner: None,
            machine: Machine::new(CallState::Disconnected),
            published,
            policy: Policy::from(config),
            connect_attempts: 0,
            call_attempts: 0,
            call_outstanding: false,
            inbound: Reassembly::new(config.max_message_bytes),
            outbound: SendQueue::new(),
            started_at: None,
            handler,
            signaler,
            finished: false,
        }
    }

    /// Session with its own command channel, for driving without a task
    #[cfg(test)]
    pub(crate) fn detached(
        config: &ClientConfig,
        token: &str,
        target: Option<&str>,
        handler: Box<dyn SignalHandler>,
    ) -> (Self, tokio::sync::mpsc::UnboundedReceiver<Command>) {
        let published = Arc::new(StateCell::default());
        let (signaler, rx) = Signaler::channel(published.clone());
        let session = Self::new(
            config,
            token.to_string(),
            target.map(str::to_string),
            handler,
            signaler,
            published,
        );
        (session, rx)
    }

    pub fn state(&self) -> CallState {
        self.machine.state()
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Token of the other side once a call is set up
    pub fn partner(&self) -> Option<&str> {
        self.partner.as_deref()
    }

    pub fn call_attempts(&self) -> u32 {
        self.call_attempts
    }

    fn fire(&mut self, event: CallEvent) -> Result<CallState, ClientError> {
        let state = self
            .machine
            .fire(event)
            .map_err(|e| ClientError::Transition {
                from: e.from,
                event: e.event,
            })?;
        self.published.store(state);
        Ok(state)
    }

    fn enqueue(&mut self, msg: &SignalMessage) -> Result<(), ClientError> {
        let payload = msg.encode()?;
        debug!("Queueing {} ({} bytes)", msg.tag(), payload.len());
        if self.outbound.push(Bytes::from(payload)) {
            Ok(())
        } else {
            Err(ClientError::NotRunning)
        }
    }

    /// About to open the transport
    pub fn begin_connect(&mut self, now: Instant) -> Result<(), ClientError> {
        self.fire(CallEvent::Connect)?;
        self.connect_attempts += 1;
        self.started_at.get_or_insert(now);
        debug!("Connection attempt {}", self.connect_attempts);
        Ok(())
    }

    /// The transport could not be opened
    pub fn connect_failed(&mut self, reason: &str) -> ConnectStep {
        if self.connect_attempts < self.policy.connect_attempts {
            info!(
                "Connection attempt {} failed ({}), retrying in {:?}",
                self.connect_attempts, reason, self.policy.connect_backoff
            );
            return ConnectStep::Retry(self.policy.connect_backoff);
        }

        warn!("Giving up after {} connection attempts", self.connect_attempts);
        let _ = self.fire(CallEvent::ConnectFailed);
        self.finish(ClientError::Connect {
            attempts: self.connect_attempts,
            reason: reason.to_string(),
        });
        ConnectStep::GiveUp
    }

    /// The transport is up: log on
    pub fn on_established(&mut self, now: Instant) -> Step {
        if let Err(e) = self.fire(CallEvent::Established) {
            return Step::Fatal(e);
        }
        info!("Connected to relay");
        self.connect_attempts = 0;
        self.started_at = Some(now);

        let logon = SignalMessage::Logon {
            token: self.token.clone(),
        };
        match self.enqueue(&logon).and_then(|_| self.fire(CallEvent::LogonSent)) {
            Ok(_) => Step::Continue,
            Err(e) => Step::Fatal(e),
        }
    }

    /// Feed a chunk received from the relay
    pub fn on_data(&mut self, chunk: &[u8], is_final: bool, remaining: usize) -> Step {
        match self.inbound.push(chunk, is_final, remaining) {
            Ok(Some(message)) => self.on_message(&message),
            Ok(None) => Step::Continue,
            Err(e) => {
                warn!("Inbound message too large: {}", e);
                Step::Fatal(e.into())
            }
        }
    }

    /// Dispatch one complete message
    pub fn on_message(&mut self, raw: &[u8]) -> Step {
        let state = self.state();
        let msg = match SignalMessage::decode(raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Failed to parse relay message in {:?}: {}", state, e);
                return Step::Fatal(e.into());
            }
        };
        debug!("Received {} in {:?}", msg.tag(), state);

        match self.dispatch(state, msg) {
            Ok(step) => step,
            Err(e) => Step::Fatal(e),
        }
    }

    fn dispatch(&mut self, state: CallState, msg: SignalMessage) -> Result<Step, ClientError> {
        match msg {
            SignalMessage::Error { error } => {
                warn!("Relay reported: {}", error);
                Err(ClientError::Server(error))
            }

            SignalMessage::Info { subscriber } if subscriber == SUBSCRIBER_DISCONNECTED => {
                info!("Partner disconnected");
                Err(ClientError::PartnerLeft)
            }

            SignalMessage::LogonAck { status } if state == CallState::Registering => {
                if !status {
                    return Err(ClientError::LogonRefused);
                }
                self.fire(CallEvent::LogonAcked)?;
                info!("Registered as {}", self.token);
                self.handler.on_registered(self.signaler.clone());
                Ok(Step::Continue)
            }

            SignalMessage::CallAnnounce { from }
                if matches!(state, CallState::Registered | CallState::CallPending) =>
            {
                if state == CallState::CallPending {
                    info!("Dropping pending call to {:?}", self.target);
                }
                info!("Incoming call from {}", from);
                self.partner = Some(from);
                self.enqueue(&SignalMessage::CallAck { status: true })?;
                self.fire(CallEvent::CallAnnounced)?;
                self.handler.on_call(false);
                Ok(Step::Continue)
            }

            SignalMessage::CallAck { status: true }
                if state == CallState::CallRequested && self.call_outstanding =>
            {
                self.call_outstanding = false;
                self.fire(CallEvent::CallAccepted)?;
                self.partner = self.target.clone();
                info!("Call to {:?} confirmed", self.partner);
                self.handler.on_call(true);
                Ok(Step::Continue)
            }

            SignalMessage::CallAck { status: false }
                if state == CallState::CallRequested && self.call_outstanding =>
            {
                self.call_outstanding = false;
                self.fire(CallEvent::CallRejected)?;

                if self.call_attempts < self.policy.call_attempts {
                    info!(
                        "Target is offline, retrying in {:?} ({}/{})",
                        self.policy.call_backoff,
                        self.call_attempts + 1,
                        self.policy.call_attempts
                    );
                    Ok(Step::RetryCall(self.policy.call_backoff))
                } else {
                    Err(ClientError::TargetUnreachable {
                        attempts: self.call_attempts,
                    })
                }
            }

            SignalMessage::Sdp { kind, sdp } if state.is_in_call() => {
                self.fire(CallEvent::SdpReceived)?;
                debug!("Remote {} received", kind.as_str());
                if self.handler.on_sdp(kind.is_offer(), &sdp) {
                    Ok(Step::Continue)
                } else {
                    Err(ClientError::Handler("sdp"))
                }
            }

            SignalMessage::Ice(candidate) if state.is_in_call() => {
                self.fire(CallEvent::IceReceived)?;
                let accepted = self.handler.on_ice(
                    &candidate.sdp_mid,
                    candidate.sdp_mline_index,
                    &candidate.candidate,
                );
                if accepted {
                    Ok(Step::Continue)
                } else {
                    Err(ClientError::Handler("ice"))
                }
            }

            other => Err(ClientError::Unexpected {
                state,
                tag: other.tag(),
            }),
        }
    }

    /// Issue the outbound call request if one is due
    pub fn poll_outbound_call(&mut self) -> Step {
        if self.state() != CallState::Registered || self.call_outstanding {
            return Step::Continue;
        }
        match self.send_call_request() {
            Ok(()) => Step::Continue,
            Err(e) => Step::Fatal(e),
        }
    }

    /// The call backoff elapsed: ask again
    pub fn retry_call(&mut self) -> Step {
        if self.state() != CallState::CallPending {
            debug!("Call retry skipped in {:?}", self.state());
            return Step::Continue;
        }
        self.call_attempts += 1;
        match self.send_call_request() {
            Ok(()) => Step::Continue,
            Err(e) => Step::Fatal(e),
        }
    }

    fn send_call_request(&mut self) -> Result<(), ClientError> {
        let Some(to) = self.target.clone() else {
            return Ok(());
        };
        info!("Calling {}", to);
        self.enqueue(&SignalMessage::CallRequest { to })?;
        self.fire(CallEvent::CallRequestSent)?;
        self.call_outstanding = true;
        Ok(())
    }

    /// Periodic check for the no-call timeout
    pub fn check_liveness(&mut self, now: Instant) -> Step {
        let state = self.state();
        if !state.is_setup() {
            return Step::Continue;
        }
        let Some(started) = self.started_at else {
            return Step::Continue;
        };
        if now.saturating_duration_since(started) > self.policy.call_setup_timeout {
            info!("No call within {:?}", self.policy.call_setup_timeout);
            return Step::Fatal(ClientError::Timeout(self.policy.call_setup_timeout));
        }
        Step::Continue
    }

    /// Apply a command sent through a [`Signaler`]
    pub(crate) fn apply(&mut self, command: Command) -> Step {
        match command {
            Command::Send { payload, event } => {
                // The state may have moved since the signaler checked it
                if let Err(e) = self.fire(event) {
                    warn!("Outbound message refused: {}", e);
                    return Step::Fatal(e);
                }
                if !self.outbound.push(payload) {
                    warn!("Outbound message refused: connection is closing");
                    return Step::Fatal(ClientError::NotRunning);
                }
                Step::Continue
            }
            Command::Hangup => self.hangup(),
        }
    }

    /// End the call from this side
    pub fn hangup(&mut self) -> Step {
        let _ = self.fire(CallEvent::Hangup);
        info!("Hanging up");
        Step::Fatal(ClientError::Hangup)
    }

    /// The owner asked the session to stop
    pub fn stop(&mut self) {
        let _ = self.fire(CallEvent::Stop);
    }

    /// Next message to write to the relay
    pub fn pop_outbound(&mut self) -> Option<Outgoing> {
        self.outbound.pop()
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// The session is over. Reports `reason` to the handler exactly once.
    pub fn finish(&mut self, reason: ClientError) {
        if self.finished {
            return;
        }
        self.finished = true;

        let idle = matches!(
            self.state(),
            CallState::Hangup | CallState::Stopping | CallState::Disconnected
        );
        if !idle {
            let _ = self.fire(CallEvent::Closed);
        }
        info!("Session ended: {}", reason);
        self.handler.on_disconnected(&reason);
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}
