//! One WebSocket connection to the live service.
//!
//! A session is single-use: `connect` once, `disconnect` once. Outbound
//! messages sent before the server acknowledges setup are queued and
//! flushed, in order, as soon as `setupComplete` arrives.

use crate::config::{LiveEndpoint, SessionConfig, TokenPlacement};
use crate::error::{RealtimeError, Result};
use crate::events::{CloseReason, ConnectionState, SessionEvent};
use crate::protocol::{ClientMessage, Content, ServerContent, ServerMessage};
use base64::Engine;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{Instrument, debug, info, warn};
use vox_telemetry::live_session_span;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

struct Outbound {
    sink: Option<WsSink>,
    pending: VecDeque<ClientMessage>,
}

struct Shared {
    id: String,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    outbound: Mutex<Outbound>,
    setup_complete: AtomicBool,
    finished: AtomicBool,
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        // The subscriber going away is not an error for the connection.
        let _ = self.events.send(event);
    }

    /// Record the end of the connection. Only the first call has any effect.
    fn finish(&self, reason: Option<CloseReason>) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        // Whatever happens while we are closing on purpose is a clean close.
        let reason = if *self.state.borrow() == ConnectionState::Closing { None } else { reason };
        match &reason {
            Some(r) => warn!(session_id = %self.id, reason = %r, "Session closed abnormally"),
            None => info!(session_id = %self.id, "Session closed"),
        }
        self.state.send_replace(ConnectionState::Closed(reason.clone()));
        self.emit(SessionEvent::Close(reason));
    }
}

/// A live protocol session bound to one credential.
pub struct LiveSession {
    shared: Arc<Shared>,
    endpoint: LiveEndpoint,
    token: String,
    lifecycle: Mutex<()>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl LiveSession {
    /// Create an idle session and the receiver its events are delivered on.
    pub fn new(
        endpoint: LiveEndpoint,
        token: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Idle);
        let shared = Arc::new(Shared {
            id: uuid::Uuid::new_v4().to_string(),
            state,
            events,
            outbound: Mutex::new(Outbound { sink: None, pending: VecDeque::new() }),
            setup_complete: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });
        let session = Self {
            shared,
            endpoint,
            token: token.into(),
            lifecycle: Mutex::new(()),
            reader: parking_lot::Mutex::new(None),
        };
        (session, rx)
    }

    /// Unique id, for logs.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// Watch connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Whether the server has acknowledged setup.
    pub fn is_setup_complete(&self) -> bool {
        self.shared.setup_complete.load(Ordering::Acquire)
    }

    /// Open the connection and send the setup message for `config`.
    ///
    /// Returns once setup has been sent; `SetupComplete` arrives as an event.
    pub async fn connect(&self, config: &SessionConfig) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        if *self.shared.state.borrow() != ConnectionState::Idle {
            return Err(RealtimeError::invalid_state("a session can only be connected once"));
        }
        config.validate()?;
        self.shared.state.send_replace(ConnectionState::Connecting);

        let stream = match self.open_socket().await {
            Ok(stream) => stream,
            Err((err, reason)) => {
                self.shared.finish(Some(reason));
                return Err(err);
            }
        };
        let (mut sink, source) = stream.split();

        let setup = ClientMessage::setup(config);
        info!(session_id = %self.shared.id, model = %config.model, "Sending setup message");
        let frame = setup.to_json()?;
        debug!(raw_setup = %frame, "Raw setup message");
        if let Err(e) = sink.send(Message::Text(frame.into())).await {
            let reason = CloseReason::Network(e.to_string());
            self.shared.finish(Some(reason));
            return Err(RealtimeError::connection(format!("failed to send setup: {e}")));
        }

        self.shared.outbound.lock().await.sink = Some(sink);
        self.shared.state.send_replace(ConnectionState::Open);
        self.shared.emit(SessionEvent::Open);

        let span = live_session_span(&self.shared.id, &config.model);
        let reader = tokio::spawn(read_loop(self.shared.clone(), source).instrument(span));
        *self.reader.lock() = Some(reader);
        Ok(())
    }

    async fn open_socket(&self) -> std::result::Result<WsStream, (RealtimeError, CloseReason)> {
        ensure_crypto_provider();
        let config_err = |e: RealtimeError| {
            let reason = CloseReason::Network(e.to_string());
            (e, reason)
        };

        let url = self.endpoint.request_url(&self.token).map_err(config_err)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| config_err(RealtimeError::connection(format!("failed to create client request: {e}"))))?;
        if *self.endpoint.token_placement() == TokenPlacement::BearerHeader {
            let header = HeaderValue::from_str(&format!("Bearer {}", self.token))
                .map_err(|e| config_err(RealtimeError::config(format!("invalid auth token header: {e}"))))?;
            request.headers_mut().insert("Authorization", header);
        }

        debug!(session_id = %self.shared.id, host = ?url.host_str(), "Opening WebSocket");
        match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request)).await {
            Ok(Ok((stream, _response))) => Ok(stream),
            Ok(Err(tungstenite::Error::Http(response))) => {
                let status = response.status().as_u16();
                if matches!(status, 401 | 403) {
                    let reason = CloseReason::Auth { code: Some(status), reason: "handshake rejected".into() };
                    Err((RealtimeError::auth(format!("handshake rejected with HTTP {status}")), reason))
                } else {
                    let msg = format!("handshake rejected with HTTP {status}");
                    Err((RealtimeError::connection(msg.clone()), CloseReason::Network(msg)))
                }
            }
            Ok(Err(e)) => {
                let msg = format!("WebSocket connect error: {e}");
                Err((RealtimeError::connection(msg.clone()), CloseReason::Network(msg)))
            }
            Err(_) => {
                let msg = format!("connect timed out after {CONNECT_TIMEOUT:?}");
                Err((RealtimeError::connection(msg.clone()), CloseReason::Network(msg)))
            }
        }
    }

    /// Send a message. Before setup completes it is queued instead.
    pub async fn send(&self, message: ClientMessage) -> Result<()> {
        if matches!(message, ClientMessage::Setup(_)) {
            return Err(RealtimeError::invalid_state("setup is sent by connect"));
        }
        if !self.shared.state.borrow().is_open() {
            return Err(RealtimeError::NotConnected);
        }

        let mut outbound = self.shared.outbound.lock().await;
        if !self.shared.setup_complete.load(Ordering::Acquire) {
            debug!(session_id = %self.shared.id, kind = message.kind(), "Queueing message until setup completes");
            outbound.pending.push_back(message);
            return Ok(());
        }

        let frame = message.to_json()?;
        let sink = outbound.sink.as_mut().ok_or(RealtimeError::NotConnected)?;
        sink.send(Message::Text(frame.into()))
            .await
            .map_err(|e| RealtimeError::connection(format!("send error: {e}")))
    }

    /// Close the connection. Waits for a pending `connect` to settle first.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        match self.state() {
            ConnectionState::Idle => {
                self.shared.finished.store(true, Ordering::Release);
                self.shared.state.send_replace(ConnectionState::Closed(None));
                return;
            }
            ConnectionState::Open => {}
            _ => return,
        }

        self.shared.state.send_replace(ConnectionState::Closing);
        {
            let mut outbound = self.shared.outbound.lock().await;
            outbound.pending.clear();
            if let Some(mut sink) = outbound.sink.take() {
                if let Err(e) = sink.send(Message::Close(None)).await {
                    debug!(error = %e, "Close frame not sent");
                }
                let _ = sink.close().await;
            }
        }

        let reader = self.reader.lock().take();
        if let Some(mut reader) = reader {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut reader).await.is_err() {
                debug!(session_id = %self.shared.id, "Server did not acknowledge close, dropping connection");
                reader.abort();
            }
        }
        self.shared.finish(None);
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

impl std::fmt::Debug for LiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSession")
            .field("id", &self.shared.id)
            .field("endpoint", &self.endpoint.url())
            .field("state", &*self.shared.state.borrow())
            .finish()
    }
}

fn ensure_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // Fails only if the host installed one first, which is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

async fn read_loop(shared: Arc<Shared>, mut source: WsSource) {
    let reason = loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => handle_frame(&shared, text.as_str()).await,
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => handle_frame(&shared, text).await,
                Err(e) => warn!(error = %e, "Dropping binary frame that is not UTF-8"),
            },
            Some(Ok(Message::Close(frame))) => {
                break frame.and_then(|f| CloseReason::from_close_code(u16::from(f.code), f.reason.to_string()));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break Some(CloseReason::Network(e.to_string())),
            None => break Some(CloseReason::Network("connection ended without a close frame".into())),
        }
    };
    shared.finish(reason);
}

async fn handle_frame(shared: &Shared, raw: &str) {
    let messages = match ServerMessage::parse(raw) {
        Ok(messages) => messages,
        Err(e) => {
            warn!(session_id = %shared.id, error = %e, "Dropping malformed server message");
            return;
        }
    };
    if messages.is_empty() {
        debug!(session_id = %shared.id, %raw, "Ignoring unrecognized server message");
    }

    for message in messages {
        if matches!(message, ServerMessage::SetupComplete) {
            complete_setup(shared).await;
            continue;
        }
        if !shared.setup_complete.load(Ordering::Acquire) {
            warn!(session_id = %shared.id, "Dropping server message received before setupComplete");
            continue;
        }
        match message {
            ServerMessage::SetupComplete => {}
            ServerMessage::ServerContent(content) => {
                for event in demux_content(content) {
                    shared.emit(event);
                }
            }
            ServerMessage::ToolCall(call) => shared.emit(SessionEvent::ToolCall(call)),
            ServerMessage::ToolCallCancellation { ids } => {
                shared.emit(SessionEvent::ToolCallCancellation { ids })
            }
            ServerMessage::GoAway { time_left } => {
                info!(session_id = %shared.id, ?time_left, "Server announced disconnect");
                shared.emit(SessionEvent::GoAway { time_left });
            }
            ServerMessage::Usage(usage) => shared.emit(SessionEvent::Usage(usage)),
        }
    }
}

async fn complete_setup(shared: &Shared) {
    let mut outbound = shared.outbound.lock().await;
    if shared.setup_complete.swap(true, Ordering::AcqRel) {
        return;
    }

    let pending = std::mem::take(&mut outbound.pending);
    if !pending.is_empty() {
        debug!(session_id = %shared.id, count = pending.len(), "Flushing messages queued before setup");
    }
    if let Some(sink) = outbound.sink.as_mut() {
        for message in pending {
            let frame = match message.to_json() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, kind = message.kind(), "Dropping unserializable queued message");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(frame.into())).await {
                warn!(error = %e, "Failed to flush queued message");
                break;
            }
        }
    }
    drop(outbound);

    info!(session_id = %shared.id, "Setup complete");
    shared.emit(SessionEvent::SetupComplete);
}

/// Split one `serverContent` into events, in delivery order: an interruption
/// ends processing; then audio; then whatever remains; turn completion last,
/// so a flush on it sees the turn's final audio.
pub(crate) fn demux_content(mut content: ServerContent) -> Vec<SessionEvent> {
    if content.interrupted {
        return vec![SessionEvent::Interrupted];
    }

    let mut events = Vec::new();
    if let Some(turn) = content.model_turn.take() {
        let (audio, other): (Vec<_>, Vec<_>) = turn.parts.into_iter().partition(|p| p.is_audio());
        for part in audio {
            let Some(data) = part.inline_data else { continue };
            match base64::engine::general_purpose::STANDARD.decode(data.data) {
                Ok(bytes) => events.push(SessionEvent::Audio(Bytes::from(bytes))),
                Err(e) => warn!(error = %e, "Dropping audio part with invalid base64"),
            }
        }
        if !other.is_empty() {
            content.model_turn = Some(Content { role: turn.role, parts: other });
        }
    }

    let has_content = content.model_turn.is_some()
        || content.input_transcription.is_some()
        || content.output_transcription.is_some()
        || content.generation_complete;
    let turn_complete = content.turn_complete;
    if has_content {
        events.push(SessionEvent::ServerContent(content));
    }
    if turn_complete {
        events.push(SessionEvent::TurnComplete);
    }
    events
}
