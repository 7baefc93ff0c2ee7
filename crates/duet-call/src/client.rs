//! Background driver for a call session
//!
//! [`CallClient`] owns the connection to the relay and runs one
//! [`CallSession`] on a tokio task. Only that task touches the session;
//! callers see the state through an atomic and talk to the session through
//! a [`Signaler`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use duet_core::{ClientConfig, Outgoing};

use crate::error::ClientError;
use crate::handler::{Command, SignalHandler, Signaler};
use crate::session::{CallSession, ConnectStep, Step};
use crate::state::{CallState, StateCell};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Stop request shared between the client handle and its task
#[derive(Default)]
struct StopSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    fn raise(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_raised(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// One participant's connection to the relay
pub struct CallClient {
    config: ClientConfig,
    token: String,
    target: Option<String>,
    state: Arc<StateCell>,
    stop: Arc<StopSignal>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CallClient {
    pub fn new(config: ClientConfig, token: impl Into<String>) -> Self {
        Self {
            config,
            token: token.into(),
            target: None,
            state: Arc::new(StateCell::default()),
            stop: Arc::new(StopSignal::default()),
            task: Mutex::new(None),
        }
    }

    /// Place an outbound call to `token` once registered
    pub fn call_to(&mut self, token: impl Into<String>) -> &mut Self {
        self.target = Some(token.into());
        self
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Current call-setup state
    pub fn state(&self) -> CallState {
        self.state.load()
    }

    /// Whether the background task is still running
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Connect to the relay and run the session in the background
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, handler: impl SignalHandler) -> Result<(), ClientError> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(ClientError::AlreadyStarted);
        }

        let url = Url::parse(&self.config.url())?;
        let (signaler, commands) = Signaler::channel(self.state.clone());
        let session = CallSession::new(
            &self.config,
            self.token.clone(),
            self.target.clone(),
            Box::new(handler),
            signaler,
            self.state.clone(),
        );

        info!("Starting call session for {} via {}", self.token, url);
        *task = Some(tokio::spawn(run(
            session,
            commands,
            self.config.clone(),
            url,
            self.stop.clone(),
        )));
        Ok(())
    }

    /// Stop the session and wait for the background task to finish.
    /// Calling it again, or before `start`, does nothing.
    pub async fn stop(&self) {
        self.stop.raise();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Call session task failed: {}", e);
            }
            debug!("Call session for {} stopped", self.token);
        }
    }
}

impl Drop for CallClient {
    fn drop(&mut self) {
        self.stop.raise();
    }
}

async fn run(
    mut session: CallSession,
    mut commands: mpsc::UnboundedReceiver<Command>,
    config: ClientConfig,
    url: Url,
    stop: Arc<StopSignal>,
) {
    let Some(ws) = connect(&mut session, &config, &url, &stop).await else {
        return;
    };

    let reason = drive(&mut session, &mut commands, &config, ws, &stop).await;
    session.finish(reason);
}

/// Open the connection, retrying as the session allows
async fn connect(
    session: &mut CallSession,
    config: &ClientConfig,
    url: &Url,
    stop: &StopSignal,
) -> Option<WsStream> {
    loop {
        if stop.is_raised() {
            session.stop();
            session.finish(ClientError::Stopped);
            return None;
        }

        if let Err(e) = session.begin_connect(Instant::now()) {
            session.finish(e);
            return None;
        }

        debug!("Connecting to relay: {}", url);
        let attempt = connect_async_with_config(url.as_str(), Some(ws_config(config)), false);
        let reason = tokio::select! {
            result = timeout(config.io_timeout(), attempt) => match result {
                Ok(Ok((ws, _response))) => return Some(ws),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {:?}", config.io_timeout()),
            },
            _ = stop.notify.notified() => {
                debug!("Connection attempt abandoned");
                session.stop();
                session.finish(ClientError::Stopped);
                return None;
            }
        };

        match session.connect_failed(&reason) {
            ConnectStep::Retry(delay) => {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = stop.notify.notified() => {}
                }
            }
            ConnectStep::GiveUp => return None,
        }
    }
}

/// Service the connection until the session ends; returns why it ended
async fn drive(
    session: &mut CallSession,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    config: &ClientConfig,
    ws: WsStream,
    stop: &StopSignal,
) -> ClientError {
    let (mut sink, mut stream) = ws.split();

    let mut liveness = interval(config.liveness_interval());
    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut retry_at: Option<tokio::time::Instant> = None;

    let mut step = session.on_established(Instant::now());

    let reason = loop {
        if let Step::Continue = step {
            step = session.poll_outbound_call();
        }
        match step {
            Step::Continue => {}
            Step::RetryCall(delay) => retry_at = Some(tokio::time::Instant::now() + delay),
            Step::Fatal(e) => break e,
        }
        if session.state() != CallState::CallPending {
            retry_at = None;
        }

        if let Err(e) = flush(session, &mut sink).await {
            break e;
        }

        if stop.is_raised() {
            session.stop();
            break ClientError::Stopped;
        }

        step = tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => session.on_data(text.as_bytes(), true, 0),
                Some(Ok(Message::Binary(data))) => session.on_data(&data, true, 0),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((1005, String::new()));
                    Step::Fatal(ClientError::Closed { code, reason })
                }
                Some(Ok(_)) => Step::Continue,
                Some(Err(e)) => Step::Fatal(e.into()),
                None => Step::Fatal(ClientError::Closed {
                    code: 1006,
                    reason: "connection dropped".into(),
                }),
            },

            Some(command) = commands.recv() => session.apply(command),

            _ = liveness.tick() => session.check_liveness(Instant::now()),

            _ = sleep_until(retry_at.unwrap_or_else(tokio::time::Instant::now)), if retry_at.is_some() => {
                retry_at = None;
                session.retry_call()
            }

            _ = stop.notify.notified() => Step::Continue,
        };
    };

    if !reason.is_transport_gone() {
        // Anything queued before the failure still goes out, then the close
        let _ = flush(session, &mut sink).await;
        let frame = CloseFrame {
            code: CloseCode::from(u16::from(reason.close_status())),
            reason: truncate(&reason.to_string()).into(),
        };
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            debug!("Failed to send close frame: {}", e);
        }
    }

    reason
}

/// Write everything the session has queued
async fn flush<S>(session: &mut CallSession, sink: &mut S) -> Result<(), ClientError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    while let Some(out) = session.pop_outbound() {
        sink.send(to_message(out)).await?;
    }
    Ok(())
}

/// Frame limits for the relay connection. Messages up to twice the
/// reassembly ceiling reach the session so oversize is reported as a
/// protocol error; anything larger fails in the transport.
fn ws_config(config: &ClientConfig) -> WebSocketConfig {
    let limit = config.max_message_bytes.saturating_mul(2);
    let mut ws = WebSocketConfig::default();
    ws.max_message_size = Some(limit);
    ws.max_frame_size = Some(limit);
    ws
}

fn to_message(out: Outgoing) -> Message {
    match String::from_utf8(out.payload.to_vec()) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    }
}

/// Close reasons must fit a control frame
fn truncate(reason: &str) -> String {
    let mut end = reason.len().min(123);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_core::SdpKind;
    use tokio_test::{assert_err, assert_ok};

    struct Quiet;

    impl SignalHandler for Quiet {
        fn on_sdp(&mut self, _is_offer: bool, _sdp: &str) -> bool {
            true
        }

        fn on_ice(&mut self, _sdp_mid: &str, _sdp_mline_index: i32, _candidate: &str) -> bool {
            true
        }
    }

    /// Config pointing at a port nobody listens on, with fast retries
    fn unreachable_config() -> ClientConfig {
        ClientConfig {
            port: 1,
            connect_backoff_ms: 10,
            io_timeout_secs: 1,
            ..ClientConfig::default()
        }
    }

    #[test]
    fn test_new_client_is_disconnected() {
        let mut client = CallClient::new(ClientConfig::default(), "caller_123456789");
        client.call_to("callee_123456789");
        assert_eq!(client.state(), CallState::Disconnected);
        assert_eq!(client.token(), "caller_123456789");
        assert!(!client.is_running());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abc"), "abc");
        assert_eq!(truncate(&"x".repeat(200)).len(), 123);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let client = CallClient::new(unreachable_config(), "caller_123456789");
        assert_ok!(client.start(Quiet));
        let err = assert_err!(client.start(Quiet));
        assert!(matches!(err, ClientError::AlreadyStarted));

        client.stop().await;
        let after_first = client.state();
        client.stop().await;
        assert_eq!(client.state(), after_first);
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let client = CallClient::new(ClientConfig::default(), "caller_123456789");
        client.stop().await;
        assert_eq!(client.state(), CallState::Disconnected);
    }

    #[tokio::test]
    async fn test_gives_up_on_unreachable_relay() {
        struct Report(mpsc::UnboundedSender<String>);

        impl SignalHandler for Report {
            fn on_sdp(&mut self, _is_offer: bool, _sdp: &str) -> bool {
                true
            }

            fn on_ice(&mut self, _mid: &str, _index: i32, _candidate: &str) -> bool {
                true
            }

            fn on_disconnected(&mut self, reason: &ClientError) {
                let _ = self.0.send(reason.to_string());
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = CallClient::new(unreachable_config(), "caller_123456789");
        client.start(Report(tx)).unwrap();

        let reason = tokio::time::timeout(std::time::Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(reason.starts_with("failed to connect after 3 attempts"));
        client.stop().await;
        assert_eq!(client.state(), CallState::Disconnected);
    }

    #[test]
    fn test_signaler_outlives_session() {
        let (signaler, rx) = Signaler::channel(Arc::new(StateCell::new(CallState::CallConfirmed)));
        drop(rx);
        assert!(matches!(
            signaler.send_sdp(SdpKind::Offer, "v=0"),
            Err(ClientError::NotRunning)
        ));
    }

    #[test]
    fn test_frame_limits_follow_ceiling() {
        let config = ClientConfig {
            max_message_bytes: 1024,
            ..ClientConfig::default()
        };
        let ws = ws_config(&config);
        assert_eq!(ws.max_message_size, Some(2048));
        assert_eq!(ws.max_frame_size, Some(2048));
    }

    #[tokio::test]
    async fn test_stop_interrupts_stalled_handshake() {
        // Accepts TCP but never answers the upgrade request
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let held = tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                open.push(socket);
            }
        });

        let config = ClientConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            io_timeout_secs: 10,
            ..ClientConfig::default()
        };
        let client = CallClient::new(config, "caller_123456789");
        assert_ok!(client.start(Quiet));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let started = Instant::now();
        client.stop().await;
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
        assert!(!client.is_running());
        assert_eq!(client.state(), CallState::Stopping);
        held.abort();
    }
}
