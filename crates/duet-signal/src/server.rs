//! WebSocket relay server
//!
//! Each accepted connection runs in its own task. The task feeds inbound
//! frames to the [`Router`] and writes whatever the router hands back when
//! woken through the connection's wake channel, so one connection's events
//! are always processed in order.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use tokio_native_tls::native_tls::{self, Identity};
use tokio_native_tls::TlsAcceptor;
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::error::CapacityError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use duet_core::{CloseStatus, Outgoing, ProtocolError, SignalConfig, SignalMessage};

use crate::peer::ConnId;
use crate::router::{Router, Transport};

/// Longest close reason a control frame can carry
const MAX_CLOSE_REASON: usize = 123;

/// How long to wait for the peer to answer our close frame
const CLOSE_LINGER: Duration = Duration::from_secs(1);

/// Handshake deadline when no I/O timeout is configured
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Request heads answered as plain HTTP instead of upgraded
const HEALTH_PREFIXES: [&[u8]; 2] = [b"GET /health ", b"GET /stats "];

/// Bytes peeked to tell a health request from an upgrade request
const HEALTH_HEAD_LEN: usize = 12;

const HEALTH_POLL: Duration = Duration::from_millis(10);

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("ssl is enabled but {0} is not set")]
    MissingTlsFile(&'static str),

    #[error("failed to read {path}: {source}")]
    TlsFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("handshake not completed within {0:?}")]
    HandshakeTimeout(Duration),
}

/// Delivers writable notifications to connection tasks
#[derive(Default)]
pub struct WsTransport {
    wakers: DashMap<ConnId, mpsc::UnboundedSender<()>>,
}

impl WsTransport {
    fn register(&self, conn: ConnId, waker: mpsc::UnboundedSender<()>) {
        self.wakers.insert(conn, waker);
    }

    fn unregister(&self, conn: ConnId) {
        self.wakers.remove(&conn);
    }
}

impl Transport for WsTransport {
    fn request_writable(&self, conn: ConnId) {
        if let Some(waker) = self.wakers.get(&conn) {
            let _ = waker.send(());
        }
    }
}

/// Unlinks the connection from the router however the task ends
struct SessionGuard {
    router: Arc<Router<WsTransport>>,
    conn: ConnId,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.router.transport().unregister(self.conn);
        self.router.on_closed(self.conn);
    }
}

/// Settings every connection task reads
struct ConnectionSettings {
    ws: WebSocketConfig,
    ceiling: usize,
    idle_timeout: Duration,
    handshake_timeout: Duration,
    tls: Option<TlsAcceptor>,
}

impl ConnectionSettings {
    fn from_config(config: &SignalConfig) -> Result<Self, ServerError> {
        let idle_timeout = config.io_timeout();
        let handshake_timeout = if idle_timeout.is_zero() {
            DEFAULT_HANDSHAKE_TIMEOUT
        } else {
            idle_timeout
        };
        Ok(Self {
            ws: ws_config(config.max_message_bytes),
            ceiling: config.max_message_bytes,
            idle_timeout,
            handshake_timeout,
            tls: tls_acceptor(config)?,
        })
    }
}

/// Signal server state
pub struct SignalServer {
    router: Arc<Router<WsTransport>>,
    config: SignalConfig,
    next_id: Arc<AtomicU64>,
    /// Connection slots; a permit is held from accept until the task ends
    slots: Option<Arc<Semaphore>>,
}

impl SignalServer {
    pub fn new(config: SignalConfig) -> Self {
        let router = Router::with_limit(WsTransport::default(), config.max_message_bytes);
        let slots = (config.max_connections > 0)
            .then(|| Arc::new(Semaphore::new(config.max_connections)));
        Self {
            router: Arc::new(router),
            config,
            next_id: Arc::new(AtomicU64::new(1)),
            slots,
        }
    }

    /// Bind and serve until the listener fails
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr).await?;
        let scheme = if self.config.ssl { "wss" } else { "ws" };
        info!("Signal server listening on {}://{}", scheme, addr);
        self.serve_listener(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), ServerError> {
        let settings = Arc::new(ConnectionSettings::from_config(&self.config)?);

        loop {
            let (stream, peer_addr) = listener.accept().await?;

            let permit = match &self.slots {
                Some(slots) => match slots.clone().try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        warn!(
                            "Refusing {}: connection limit of {} reached",
                            peer_addr, self.config.max_connections
                        );
                        drop(stream);
                        continue;
                    }
                },
                None => None,
            };

            let conn = ConnId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
            let router = self.router.clone();
            let settings = settings.clone();

            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = handle_connection(stream, peer_addr, router, conn, &settings).await {
                    debug!("Connection error from {}: {}", peer_addr, e);
                }
            });
        }
    }

    pub fn router(&self) -> &Arc<Router<WsTransport>> {
        &self.router
    }

    /// Open connections (for monitoring)
    pub fn session_count(&self) -> usize {
        self.router.session_count()
    }

    /// Active pairings (for monitoring)
    pub fn pair_count(&self) -> usize {
        self.router.pair_count()
    }
}

impl Default for SignalServer {
    fn default() -> Self {
        Self::new(SignalConfig::default())
    }
}

/// Handle a single connection (HTTP health request or WebSocket)
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    router: Arc<Router<WsTransport>>,
    conn: ConnId,
    settings: &ConnectionSettings,
) -> Result<(), ServerError> {
    let deadline = settings.handshake_timeout;

    match &settings.tls {
        Some(acceptor) => {
            let stream = timeout(deadline, acceptor.accept(stream))
                .await
                .map_err(|_| ServerError::HandshakeTimeout(deadline))??;
            serve_websocket(stream, peer_addr, router, conn, settings).await
        }
        None => {
            let mut stream = stream;
            let health = timeout(deadline, sniff_health_request(&stream))
                .await
                .map_err(|_| ServerError::HandshakeTimeout(deadline))??;
            if health {
                return handle_http_request(&mut stream, &router).await;
            }
            serve_websocket(stream, peer_addr, router, conn, settings).await
        }
    }
}

/// Run the relay protocol over an upgraded connection
async fn serve_websocket<S>(
    stream: S,
    peer_addr: SocketAddr,
    router: Arc<Router<WsTransport>>,
    conn: ConnId,
    settings: &ConnectionSettings,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = settings.handshake_timeout;
    let ws_stream = timeout(deadline, accept_async_with_config(stream, Some(settings.ws)))
        .await
        .map_err(|_| ServerError::HandshakeTimeout(deadline))??;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (wake_tx, mut wake_rx) = mpsc::unbounded_channel();
    router.transport().register(conn, wake_tx);
    router.on_established(conn);
    let _guard = SessionGuard {
        router: router.clone(),
        conn,
    };
    debug!("New connection from {} as {}", peer_addr, conn);

    let idle_timeout = settings.idle_timeout;
    let keepalive = (idle_timeout / 2).max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(keepalive);
    ticker.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        router.on_data(conn, text.as_bytes(), true, 0);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        router.on_data(conn, &data, true, 0);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(WsError::Capacity(e))) => {
                        // The frame never reached the router; answer as it would
                        let err = oversized(&e, settings.ceiling);
                        warn!("Closing {}: {}", conn, e);
                        if let Ok(payload) = SignalMessage::error(&err).encode() {
                            let out = Outgoing {
                                payload: payload.into(),
                                close: None,
                            };
                            let _ = ws_sender.send(to_message(out)).await;
                        }
                        let frame = close_frame(err.close_status(), err.to_string().as_bytes());
                        let _ = ws_sender.send(Message::Close(Some(frame))).await;
                        break;
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error on {}: {}", conn, e);
                        router.on_error(conn);
                        break;
                    }
                }
            }

            Some(()) = wake_rx.recv() => {
                let Some(out) = router.on_writable(conn) else {
                    continue;
                };
                let close = out.close.clone();
                ws_sender.send(to_message(out)).await?;

                if let Some(close) = close {
                    let frame = close_frame(close.status, &close.reason);
                    debug!("Closing {} with {:?}", conn, close.status);
                    ws_sender.send(Message::Close(Some(frame))).await?;

                    // Give the peer a moment to answer the close handshake
                    let _ = timeout(CLOSE_LINGER, async {
                        while let Some(Ok(msg)) = ws_receiver.next().await {
                            if msg.is_close() {
                                break;
                            }
                        }
                    })
                    .await;
                    break;
                }
            }

            _ = ticker.tick() => {
                if !idle_timeout.is_zero() && last_seen.elapsed() > idle_timeout {
                    info!("Closing idle connection {}", conn);
                    let frame = close_frame(CloseStatus::GoingAway, b"idle timeout");
                    let _ = ws_sender.send(Message::Close(Some(frame))).await;
                    break;
                }
                ws_sender.send(Message::Ping(Vec::new())).await?;
            }
        }
    }

    debug!("Connection closed: {}", conn);
    Ok(())
}

/// Peek at the request head until it is clear whether it is a health request.
/// Nothing is consumed, so an upgrade request is read again by the handshake.
async fn sniff_health_request(stream: &TcpStream) -> io::Result<bool> {
    let mut head = [0u8; HEALTH_HEAD_LEN];
    loop {
        let n = stream.peek(&mut head).await?;
        if n == 0 {
            return Ok(false);
        }
        let seen = &head[..n];
        if is_health_request(seen) {
            return Ok(true);
        }
        if n == head.len() || seen.contains(&b'\n') || !may_be_health_request(seen) {
            return Ok(false);
        }
        tokio::time::sleep(HEALTH_POLL).await;
    }
}

fn is_health_request(head: &[u8]) -> bool {
    HEALTH_PREFIXES.iter().any(|prefix| head.starts_with(prefix))
}

/// Whether more bytes could still turn `head` into a health request
fn may_be_health_request(head: &[u8]) -> bool {
    HEALTH_PREFIXES.iter().any(|prefix| prefix.starts_with(head))
}

/// Frame limits for accepted connections. Messages up to twice the
/// reassembly ceiling reach the router so oversize is reported there.
fn ws_config(max_message_bytes: usize) -> WebSocketConfig {
    let limit = max_message_bytes.saturating_mul(2);
    let mut ws = WebSocketConfig::default();
    ws.max_message_size = Some(limit);
    ws.max_frame_size = Some(limit);
    ws
}

fn oversized(e: &CapacityError, ceiling: usize) -> ProtocolError {
    let size = match e {
        CapacityError::MessageTooLong { size, .. } => *size,
        _ => 0,
    };
    ProtocolError::Oversized { size, max: ceiling }
}

/// Build the TLS acceptor when `ssl` is enabled
fn tls_acceptor(config: &SignalConfig) -> Result<Option<TlsAcceptor>, ServerError> {
    if !config.ssl {
        return Ok(None);
    }
    let cert = read_tls_file(config.cert_file.as_deref(), "cert_file")?;
    let key = read_tls_file(config.pkey_file.as_deref(), "pkey_file")?;
    let identity = Identity::from_pkcs8(&cert, &key)?;
    let acceptor = native_tls::TlsAcceptor::new(identity)?;
    Ok(Some(TlsAcceptor::from(acceptor)))
}

fn read_tls_file(path: Option<&Path>, name: &'static str) -> Result<Vec<u8>, ServerError> {
    let path = path.ok_or(ServerError::MissingTlsFile(name))?;
    std::fs::read(path).map_err(|source| ServerError::TlsFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Relayed payloads go out as text when they are valid UTF-8
fn to_message(out: Outgoing) -> Message {
    match String::from_utf8(out.payload.to_vec()) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    }
}

fn close_frame(status: CloseStatus, reason: &[u8]) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(u16::from(status)),
        reason: truncate_reason(reason).into(),
    }
}

/// Cut the reason to fit a control frame without splitting a character
fn truncate_reason(reason: &[u8]) -> String {
    let text = String::from_utf8_lossy(reason);
    let mut end = text.len().min(MAX_CLOSE_REASON);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Handle an HTTP request (for health checks)
async fn handle_http_request(
    stream: &mut TcpStream,
    router: &Router<WsTransport>,
) -> Result<(), ServerError> {
    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);

    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let sessions = router.session_count();
    let registered = router.registered_count();
    let pairs = router.pair_count();

    let (status, body) = match path {
        "/health" => (
            "200 OK",
            format!(
                r#"{{"status":"healthy","sessions":{},"pairs":{}}}"#,
                sessions, pairs
            ),
        ),
        "/stats" => (
            "200 OK",
            format!(
                r#"{{"sessions":{},"registered":{},"pairs":{}}}"#,
                sessions, registered, pairs
            ),
        ),
        _ => ("404 Not Found", r#"{"error":"not found"}"#.to_string()),
    };

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    Ok(())
}
