//! Relay connection router
//!
//! Owns every connection the relay knows about, registers tokens, pairs call
//! requests and forwards post-pairing traffic. All registry access goes
//! through one lock so that "find target and pair" can never hand the same
//! token to two callers.
//!
//! The router does no I/O. Outbound messages are queued per connection and
//! the transport is asked for a writable notification; the transport then
//! pulls the head of the queue with [`Router::on_writable`].

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use duet_core::{
    validate_token, CloseDirective, Outgoing, ProtocolError, SignalMessage,
    DEFAULT_MAX_MESSAGE_BYTES,
};

use crate::peer::{ConnId, Peer, PeerEvent, PeerState};

/// Transport-side hooks the router needs
pub trait Transport: Send + Sync {
    /// Ask for a writable notification on `conn`. The notification is not
    /// repeated automatically; the router asks again while data remains.
    ///
    /// Called with the registry locked, so implementations must not call
    /// back into the router.
    fn request_writable(&self, conn: ConnId);
}

/// Outcome of feeding a chunk to the router
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataStatus {
    /// The message is incomplete
    AwaitingMore,
    /// A complete message was handled
    Dispatched,
    /// The connection was rejected and will close after flushing
    Rejected,
}

#[derive(Default)]
struct Registry {
    peers: HashMap<ConnId, Peer>,
    tokens: HashMap<String, ConnId>,
}

/// Pairing and relay engine
pub struct Router<T> {
    registry: Mutex<Registry>,
    transport: T,
    max_message_bytes: usize,
}

impl<T: Transport> Router<T> {
    pub fn new(transport: T) -> Self {
        Self::with_limit(transport, DEFAULT_MAX_MESSAGE_BYTES)
    }

    /// Router with a custom ceiling on unconsumed inbound bytes
    pub fn with_limit(transport: T, max_message_bytes: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            transport,
            max_message_bytes,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// A transport connection came up
    pub fn on_established(&self, conn: ConnId) {
        let mut reg = self.registry.lock();
        reg.peers
            .insert(conn, Peer::new(conn, self.max_message_bytes));
        debug!("Connection established: {}", conn);
    }

    /// Feed a chunk received on `conn`
    pub fn on_data(
        &self,
        conn: ConnId,
        chunk: &[u8],
        is_final: bool,
        remaining: usize,
    ) -> DataStatus {
        let mut reg = self.registry.lock();

        let Some(peer) = reg.peers.get_mut(&conn) else {
            warn!("Data from unknown connection {}", conn);
            return DataStatus::Rejected;
        };

        if peer.outbound.is_closing() {
            debug!("Ignoring data from closing connection {}", conn);
            return DataStatus::Rejected;
        }

        let message = match peer.inbound.push(chunk, is_final, remaining) {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("Waiting for more data from {}", conn);
                return DataStatus::AwaitingMore;
            }
            Err(e) => {
                warn!("Message size is out of limits on {}: {:?}", conn, e);
                reg.reject(&self.transport, conn, &e);
                return DataStatus::Rejected;
            }
        };

        let registered = peer.token.is_some();
        let result = if registered {
            reg.route(&self.transport, conn, message)
        } else {
            reg.register(&self.transport, conn, &message)
        };

        match result {
            Ok(()) => DataStatus::Dispatched,
            Err(e) => {
                warn!("Rejecting {}: {}", conn, e);
                reg.reject(&self.transport, conn, &e);
                DataStatus::Rejected
            }
        }
    }

    /// The transport can write to `conn`. Returns the next message to write;
    /// if it carries a close directive the transport closes the connection
    /// after writing it.
    pub fn on_writable(&self, conn: ConnId) -> Option<Outgoing> {
        let mut reg = self.registry.lock();
        let peer = reg.peers.get_mut(&conn)?;
        let out = peer.outbound.pop()?;

        if out.close.is_none() && !peer.outbound.is_empty() {
            self.transport.request_writable(conn);
        }

        debug!("Writing {} bytes to {}", out.payload.len(), conn);
        Some(out)
    }

    /// The transport connection went away
    pub fn on_closed(&self, conn: ConnId) {
        let mut reg = self.registry.lock();
        reg.remove(&self.transport, conn);
    }

    /// The transport connection failed
    pub fn on_error(&self, conn: ConnId) {
        warn!("Connection error on {}", conn);
        self.on_closed(conn);
    }

    /// Number of open connections, registered or not
    pub fn session_count(&self) -> usize {
        self.registry.lock().peers.len()
    }

    /// Number of registered tokens
    pub fn registered_count(&self) -> usize {
        self.registry.lock().tokens.len()
    }

    /// Number of active pairings
    pub fn pair_count(&self) -> usize {
        let reg = self.registry.lock();
        reg.peers.values().filter(|p| p.partner.is_some()).count() / 2
    }

    pub fn partner_of(&self, conn: ConnId) -> Option<ConnId> {
        self.registry.lock().peers.get(&conn).and_then(Peer::partner)
    }

    pub fn token_of(&self, conn: ConnId) -> Option<String> {
        self.registry
            .lock()
            .peers
            .get(&conn)
            .and_then(|p| p.token().map(str::to_owned))
    }

    pub fn state_of(&self, conn: ConnId) -> Option<PeerState> {
        self.registry.lock().peers.get(&conn).map(Peer::state)
    }
}

impl Registry {
    /// First complete message on a connection must be a logon
    fn register<T: Transport>(
        &mut self,
        transport: &T,
        conn: ConnId,
        raw: &[u8],
    ) -> Result<(), ProtocolError> {
        let token = match SignalMessage::decode(raw)? {
            SignalMessage::Logon { token } => token,
            other => {
                debug!("Expected logon from {}, got {}", conn, other.tag());
                return Err(ProtocolError::Unexpected);
            }
        };

        if !validate_token(&token) {
            return Err(ProtocolError::BadToken);
        }
        if self.tokens.contains_key(&token) {
            return Err(ProtocolError::TokenInUse);
        }

        let peer = self.peers.get_mut(&conn).ok_or(ProtocolError::Internal)?;
        peer.state
            .fire(PeerEvent::LogonAccepted)
            .map_err(|_| ProtocolError::Internal)?;
        peer.token = Some(token.clone());
        self.tokens.insert(token.clone(), conn);

        info!("Peer {} registered as {}", conn, token);
        self.send(transport, conn, &SignalMessage::LogonAck { status: true })
    }

    /// Handle a message from a registered connection
    fn route<T: Transport>(
        &mut self,
        transport: &T,
        conn: ConnId,
        raw: Bytes,
    ) -> Result<(), ProtocolError> {
        let (partner, caller) = {
            let peer = self.peers.get(&conn).ok_or(ProtocolError::Internal)?;
            (peer.partner, peer.token.clone())
        };

        if let Some(partner) = partner {
            if !self.enqueue(transport, partner, raw) {
                debug!("Partner {} of {} is closing, message dropped", partner, conn);
            }
            return Ok(());
        }

        let caller = caller.ok_or(ProtocolError::Internal)?;
        let to = match SignalMessage::decode(&raw)? {
            SignalMessage::CallRequest { to } => to,
            other => {
                debug!("Expected call request from {}, got {}", conn, other.tag());
                return Err(ProtocolError::Unexpected);
            }
        };

        if !validate_token(&to) {
            return Err(ProtocolError::BadTarget);
        }

        let target = self
            .tokens
            .get(&to)
            .copied()
            .filter(|&t| t != conn)
            .filter(|t| self.peers.get(t).is_some_and(Peer::is_callable));

        let Some(target) = target else {
            info!("Call from {} to {}: target is offline", caller, to);
            return self.send(transport, conn, &SignalMessage::CallAck { status: false });
        };

        self.pair(conn, target)?;
        info!("Paired {} with {}", caller, to);

        self.send(
            transport,
            target,
            &SignalMessage::CallAnnounce { from: caller },
        )
    }

    fn pair(&mut self, a: ConnId, b: ConnId) -> Result<(), ProtocolError> {
        for (this, other) in [(a, b), (b, a)] {
            let peer = self.peers.get_mut(&this).ok_or(ProtocolError::Internal)?;
            peer.state.fire(PeerEvent::Paired).map_err(|e| {
                error!("Pairing {} failed: {}", this, e);
                ProtocolError::Internal
            })?;
            peer.partner = Some(other);
        }
        Ok(())
    }

    fn send<T: Transport>(
        &mut self,
        transport: &T,
        conn: ConnId,
        msg: &SignalMessage,
    ) -> Result<(), ProtocolError> {
        let payload = msg.encode().map_err(|e| {
            error!("Failed to encode {}: {}", msg.tag(), e);
            ProtocolError::Internal
        })?;
        self.enqueue(transport, conn, Bytes::from(payload));
        Ok(())
    }

    /// Queue raw bytes on `conn` and ask for a writable notification
    fn enqueue<T: Transport>(&mut self, transport: &T, conn: ConnId, payload: Bytes) -> bool {
        let Some(peer) = self.peers.get_mut(&conn) else {
            warn!("Write to unknown connection {}", conn);
            return false;
        };
        if !peer.outbound.push(payload) {
            return false;
        }
        transport.request_writable(conn);
        true
    }

    /// Queue an error payload and close `conn` once it is written
    fn reject<T: Transport>(&mut self, transport: &T, conn: ConnId, e: &ProtocolError) {
        let Some(peer) = self.peers.get_mut(&conn) else {
            return;
        };

        let reason = e.to_string();
        let payload = SignalMessage::error(e)
            .encode()
            .unwrap_or_else(|_| br#"{"error":"internal error"}"#.to_vec());
        let close = CloseDirective::new(e.close_status(), reason);

        if peer.outbound.push_final(Bytes::from(payload), close) {
            let _ = peer.state.fire(PeerEvent::Rejected);
            transport.request_writable(conn);
        }
    }

    fn remove<T: Transport>(&mut self, transport: &T, conn: ConnId) {
        let Some(mut peer) = self.peers.remove(&conn) else {
            debug!("Remove: unknown connection {}", conn);
            return;
        };
        let _ = peer.state.fire(PeerEvent::Closed);

        if let Some(token) = peer.token.as_deref() {
            if self.tokens.get(token) == Some(&conn) {
                self.tokens.remove(token);
            }
        }

        if let Some(partner) = peer.partner.take() {
            if let Some(other) = self.peers.get_mut(&partner) {
                other.partner = None;
                let _ = other.state.fire(PeerEvent::PartnerLeft);
            }
            let _ = self.send(transport, partner, &SignalMessage::partner_disconnected());
            info!("Peer {} left, notified partner {}", conn, partner);
        }

        debug!(
            "Connection closed: {} after {:?}",
            conn,
            peer.connected_at.elapsed()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_core::CloseStatus;

    #[derive(Default)]
    struct RecordingTransport {
        wakes: Mutex<Vec<ConnId>>,
    }

    impl RecordingTransport {
        fn wakes_for(&self, conn: ConnId) -> usize {
            self.wakes.lock().iter().filter(|&&c| c == conn).count()
        }
    }

    impl Transport for RecordingTransport {
        fn request_writable(&self, conn: ConnId) {
            self.wakes.lock().push(conn);
        }
    }

    const A: ConnId = ConnId::new(1);
    const B: ConnId = ConnId::new(2);
    const C: ConnId = ConnId::new(3);

    fn close_status_of(out: &Outgoing) -> Option<CloseStatus> {
        out.close.as_ref().map(|c| c.status)
    }

    fn router() -> Router<RecordingTransport> {
        Router::new(RecordingTransport::default())
    }

    fn send(router: &Router<RecordingTransport>, conn: ConnId, json: &str) -> DataStatus {
        router.on_data(conn, json.as_bytes(), true, 0)
    }

    fn drain(router: &Router<RecordingTransport>, conn: ConnId) -> Vec<Outgoing> {
        let mut out = Vec::new();
        while let Some(o) = router.on_writable(conn) {
            out.push(o);
        }
        out
    }

    fn drain_messages(router: &Router<RecordingTransport>, conn: ConnId) -> Vec<SignalMessage> {
        drain(router, conn)
            .iter()
            .map(|o| SignalMessage::decode(&o.payload).unwrap())
            .collect()
    }

    fn logon(router: &Router<RecordingTransport>, conn: ConnId, token: &str) {
        router.on_established(conn);
        let json = format!(r#"{{"type":"logon","token":"{}"}}"#, token);
        assert_eq!(send(router, conn, &json), DataStatus::Dispatched);
        assert_eq!(
            drain_messages(router, conn),
            vec![SignalMessage::LogonAck { status: true }]
        );
    }

    fn pair(router: &Router<RecordingTransport>) {
        logon(router, A, "caller_123456789");
        logon(router, B, "callee_123456789");
        assert_eq!(
            send(router, A, r#"{"type":"call","to":"callee_123456789"}"#),
            DataStatus::Dispatched
        );
        drain(router, B);
    }

    fn expect_rejection(out: &[Outgoing], status: CloseStatus, error: &str) {
        assert_eq!(out.len(), 1);
        assert_eq!(close_status_of(&out[0]), Some(status));
        assert_eq!(
            SignalMessage::decode(&out[0].payload).unwrap(),
            SignalMessage::Error {
                error: error.into()
            }
        );
    }

    #[test]
    fn test_logon() {
        let router = router();
        logon(&router, A, "caller_123456789");
        assert_eq!(router.token_of(A).as_deref(), Some("caller_123456789"));
        assert_eq!(router.state_of(A), Some(PeerState::Registered));
        assert_eq!(router.registered_count(), 1);
        assert!(router.transport().wakes_for(A) >= 1);
    }

    #[test]
    fn test_duplicate_token_rejected() {
        let router = router();
        logon(&router, A, "caller_123456789");

        router.on_established(B);
        let status = send(&router, B, r#"{"type":"logon","token":"caller_123456789"}"#);
        assert_eq!(status, DataStatus::Rejected);
        expect_rejection(
            &drain(&router, B),
            CloseStatus::InvalidPayload,
            "'token' is already online",
        );
        assert_eq!(router.state_of(B), Some(PeerState::Closing));

        // The first registration is untouched
        assert_eq!(router.state_of(A), Some(PeerState::Registered));
        assert_eq!(router.token_of(B), None);
    }

    #[test]
    fn test_bad_logons_rejected() {
        let cases = [
            (r#"{"type":"logon","token":"short"}"#, CloseStatus::InvalidPayload, "wrong 'token' format"),
            (r#"{"type":"logon"}"#, CloseStatus::InvalidPayload, "'token' missed"),
            (r#"{"type":"call","to":"callee_123456789"}"#, CloseStatus::UnexpectedCondition, "unexpected message"),
        ];

        for (json, status, error) in cases {
            let router = router();
            router.on_established(A);
            assert_eq!(send(&router, A, json), DataStatus::Rejected);
            expect_rejection(&drain(&router, A), status, error);
        }
    }

    #[test]
    fn test_malformed_json_rejected() {
        let router = router();
        router.on_established(A);
        assert_eq!(send(&router, A, "{\"type\": "), DataStatus::Rejected);

        let out = drain(&router, A);
        assert_eq!(close_status_of(&out[0]), Some(CloseStatus::InvalidPayload));
        match SignalMessage::decode(&out[0].payload).unwrap() {
            SignalMessage::Error { error } => assert!(error.starts_with("failed to parse JSON")),
            other => panic!("wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_closing_connection_ignores_data() {
        let router = router();
        router.on_established(A);
        send(&router, A, r#"{"type":"logon","token":"x"}"#);
        assert_eq!(
            send(&router, A, r#"{"type":"logon","token":"caller_123456789"}"#),
            DataStatus::Rejected
        );
        assert_eq!(drain(&router, A).len(), 1);
        assert_eq!(router.registered_count(), 0);
    }

    #[test]
    fn test_call_pairs_sessions() {
        let router = router();
        logon(&router, A, "caller_123456789");
        logon(&router, B, "callee_123456789");

        send(&router, A, r#"{"type":"call","to":"callee_123456789"}"#);

        assert_eq!(
            drain_messages(&router, B),
            vec![SignalMessage::CallAnnounce {
                from: "caller_123456789".into()
            }]
        );
        assert!(drain(&router, A).is_empty());
        assert_eq!(router.partner_of(A), Some(B));
        assert_eq!(router.partner_of(B), Some(A));
        assert_eq!(router.state_of(A), Some(PeerState::Paired));
        assert_eq!(router.state_of(B), Some(PeerState::Paired));
        assert_eq!(router.pair_count(), 1);
    }

    #[test]
    fn test_call_offline_target() {
        let router = router();
        logon(&router, A, "caller_123456789");

        let status = send(&router, A, r#"{"type":"call","to":"callee_123456789"}"#);
        assert_eq!(status, DataStatus::Dispatched);
        let out = drain(&router, A);
        assert_eq!(out.len(), 1);
        assert!(out[0].close.is_none());
        assert_eq!(
            SignalMessage::decode(&out[0].payload).unwrap(),
            SignalMessage::CallAck { status: false }
        );
        assert_eq!(router.partner_of(A), None);

        // Retry succeeds once the target shows up
        logon(&router, B, "callee_123456789");
        send(&router, A, r#"{"type":"call","to":"callee_123456789"}"#);
        assert_eq!(router.partner_of(A), Some(B));
    }

    #[test]
    fn test_paired_target_is_unavailable() {
        let router = router();
        pair(&router);
        logon(&router, C, "third_123456789");

        send(&router, C, r#"{"type":"call","to":"callee_123456789"}"#);
        assert_eq!(
            drain_messages(&router, C),
            vec![SignalMessage::CallAck { status: false }]
        );
        assert_eq!(router.partner_of(B), Some(A));
        assert!(drain(&router, B).is_empty());
    }

    #[test]
    fn test_self_call_is_unavailable() {
        let router = router();
        logon(&router, A, "caller_123456789");
        send(&router, A, r#"{"type":"call","to":"caller_123456789"}"#);
        assert_eq!(
            drain_messages(&router, A),
            vec![SignalMessage::CallAck { status: false }]
        );
        assert_eq!(router.partner_of(A), None);
    }

    #[test]
    fn test_bad_call_requests_rejected() {
        let cases = [
            (r#"{"type":"call","to":"short"}"#, CloseStatus::InvalidPayload, "wrong 'to' format"),
            (r#"{"type":"call"}"#, CloseStatus::InvalidPayload, "'to' missed"),
            (r#"{"type":"offer","sdp":"v=0"}"#, CloseStatus::UnexpectedCondition, "unexpected message"),
        ];

        for (json, status, error) in cases {
            let router = router();
            logon(&router, A, "caller_123456789");
            assert_eq!(send(&router, A, json), DataStatus::Rejected);
            expect_rejection(&drain(&router, A), status, error);
        }
    }

    #[test]
    fn test_paired_traffic_forwarded_verbatim_in_order() {
        let router = router();
        pair(&router);

        let messages: [&[u8]; 4] = [
            br#"{"type": "call", "status": true}"#,
            br#"{"type":"offer","sdp":"v=0..."}"#,
            b"not even json \x00\x01",
            br#"{"candidate":{"sdpMid":"0","sdpMLineIndex":0,"candidate":"c"}}"#,
        ];
        for m in messages {
            assert_eq!(router.on_data(A, m, true, 0), DataStatus::Dispatched);
        }

        let out = drain(&router, B);
        let payloads: Vec<&[u8]> = out.iter().map(|o| &o.payload[..]).collect();
        assert_eq!(payloads, messages.to_vec());
        assert!(drain(&router, A).is_empty());
    }

    #[test]
    fn test_fragmented_forward() {
        let router = router();
        pair(&router);

        assert_eq!(router.on_data(A, b"{\"type\":\"an", false, 0), DataStatus::AwaitingMore);
        assert_eq!(router.on_data(A, b"swer\",", true, 9), DataStatus::AwaitingMore);
        assert_eq!(router.on_data(A, b"\"sdp\":\"x\"}", true, 0), DataStatus::Dispatched);

        let out = drain(&router, B);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].payload[..], b"{\"type\":\"answer\",\"sdp\":\"x\"}");
    }

    #[test]
    fn test_writable_rerequested_while_queue_not_empty() {
        let router = router();
        pair(&router);
        let before = router.transport().wakes_for(B);

        router.on_data(A, b"one", true, 0);
        router.on_data(A, b"two", true, 0);
        assert_eq!(router.transport().wakes_for(B), before + 2);

        // Popping the first message asks again because "two" is still queued
        assert_eq!(&router.on_writable(B).unwrap().payload[..], b"one");
        assert_eq!(router.transport().wakes_for(B), before + 3);

        assert_eq!(&router.on_writable(B).unwrap().payload[..], b"two");
        assert_eq!(router.transport().wakes_for(B), before + 3);
        assert!(router.on_writable(B).is_none());
    }

    #[test]
    fn test_partner_disconnect() {
        let router = router();
        pair(&router);

        router.on_closed(B);

        assert_eq!(
            drain_messages(&router, A),
            vec![SignalMessage::Info {
                subscriber: "disconnected".into()
            }]
        );
        assert_eq!(router.partner_of(A), None);
        assert_eq!(router.state_of(A), Some(PeerState::Registered));
        assert_eq!(router.state_of(B), None);
        assert_eq!(router.pair_count(), 0);
        assert_eq!(router.registered_count(), 1);

        // B's token is free again and A may call it once it returns
        logon(&router, B, "callee_123456789");
        send(&router, A, r#"{"type":"call","to":"callee_123456789"}"#);
        assert_eq!(router.partner_of(B), Some(A));
    }

    #[test]
    fn test_error_removes_session() {
        let router = router();
        logon(&router, A, "caller_123456789");
        router.on_error(A);
        assert_eq!(router.session_count(), 0);
        assert_eq!(router.registered_count(), 0);

        // Closing twice is harmless
        router.on_closed(A);
    }

    #[test]
    fn test_ceiling_boundary() {
        let router = Router::with_limit(RecordingTransport::default(), 64);
        pair(&router);

        let exact = vec![b'x'; 64];
        assert_eq!(router.on_data(A, &exact, true, 0), DataStatus::Dispatched);
        assert_eq!(drain(&router, B)[0].payload.len(), 64);

        assert_eq!(router.on_data(A, &exact[..40], false, 0), DataStatus::AwaitingMore);
        assert_eq!(router.on_data(A, &exact[..25], true, 0), DataStatus::Rejected);
        expect_rejection(
            &drain(&router, A),
            CloseStatus::InvalidPayload,
            "too many unparsed data received",
        );
        assert!(drain(&router, B).is_empty());
    }

    #[test]
    fn test_default_ceiling() {
        let router = router();
        pair(&router);

        let exact = vec![b'y'; DEFAULT_MAX_MESSAGE_BYTES];
        assert_eq!(router.on_data(A, &exact, true, 0), DataStatus::Dispatched);

        let over = vec![b'y'; DEFAULT_MAX_MESSAGE_BYTES + 1];
        assert_eq!(router.on_data(A, &over, true, 0), DataStatus::Rejected);
    }

    #[test]
    fn test_unknown_connection() {
        let router = router();
        assert_eq!(send(&router, A, "{}"), DataStatus::Rejected);
        assert!(router.on_writable(A).is_none());
    }

}
