//! The session orchestrator.
//!
//! [`LiveClient`] owns the current [`LiveSession`] and wires it to the audio
//! pipelines: model audio goes to playback, interruptions stop playback,
//! microphone blocks go out as realtime input and registered tools are run
//! automatically. Everything else is forwarded to the host.
//!
//! Reconnection is always host-driven. After an auth failure the credential
//! cache is cleared so the next [`connect`](LiveClient::connect) fetches a
//! fresh token.

use crate::config::{LiveEndpoint, SessionConfig, ToolDeclaration};
use crate::credentials::CredentialCache;
use crate::error::{RealtimeError, Result};
use crate::events::{ConnectionState, SessionEvent};
use crate::protocol::{ClientMessage, FunctionCall, FunctionResponse, ToolCall};
use crate::session::LiveSession;
use crate::tools::{FnToolHandler, ToolHandler, ToolRegistry};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, trace, warn};
use vox_audio::{CaptureEvent, CapturePipeline, PlaybackPipeline};

const ROUTER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Builder for [`LiveClient`].
#[derive(Default)]
pub struct LiveClientBuilder {
    endpoint: Option<LiveEndpoint>,
    credentials: Option<Arc<CredentialCache>>,
    playback: Option<Arc<PlaybackPipeline>>,
    capture: Option<CapturePipeline>,
    config: SessionConfig,
    tools: ToolRegistry,
}

impl LiveClientBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Live service endpoint.
    pub fn endpoint(mut self, endpoint: LiveEndpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Credential cache consulted on every connect.
    pub fn credentials(mut self, credentials: Arc<CredentialCache>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Pipeline model audio is played on.
    pub fn playback(mut self, playback: Arc<PlaybackPipeline>) -> Self {
        self.playback = Some(playback);
        self
    }

    /// Microphone pipeline. Without one, `start_microphone` fails.
    pub fn capture(mut self, capture: CapturePipeline) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Session configuration for the next connect.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a tool with a handler.
    pub fn tool(mut self, declaration: ToolDeclaration, handler: impl ToolHandler + 'static) -> Self {
        self.tools.register(declaration, Arc::new(handler));
        self
    }

    /// Register a tool with a closure handler.
    pub fn tool_fn<F>(self, declaration: ToolDeclaration, handler: F) -> Self
    where
        F: Fn(&FunctionCall) -> Result<Value> + Send + Sync + 'static,
    {
        self.tool(declaration, FnToolHandler::new(handler))
    }

    /// Build the client and the receiver host events arrive on.
    pub fn build(self) -> Result<(LiveClient, mpsc::UnboundedReceiver<SessionEvent>)> {
        let endpoint = self.endpoint.ok_or_else(|| RealtimeError::config("endpoint is required"))?;
        let credentials = self.credentials.ok_or_else(|| RealtimeError::config("credential cache is required"))?;
        let playback = self.playback.ok_or_else(|| RealtimeError::config("playback pipeline is required"))?;

        let (host, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            endpoint,
            credentials,
            playback,
            capture: self.capture,
            config: parking_lot::RwLock::new(self.config),
            tools: Arc::new(self.tools),
            host,
            current: parking_lot::RwLock::new(None),
        });
        let client = LiveClient {
            inner,
            lifecycle: tokio::sync::Mutex::new(()),
            router: parking_lot::Mutex::new(None),
            microphone: parking_lot::Mutex::new(None),
        };
        Ok((client, rx))
    }
}

struct ClientInner {
    endpoint: LiveEndpoint,
    credentials: Arc<CredentialCache>,
    playback: Arc<PlaybackPipeline>,
    capture: Option<CapturePipeline>,
    config: parking_lot::RwLock<SessionConfig>,
    tools: Arc<ToolRegistry>,
    host: mpsc::UnboundedSender<SessionEvent>,
    current: parking_lot::RwLock<Option<Arc<LiveSession>>>,
}

impl ClientInner {
    fn session(&self) -> Option<Arc<LiveSession>> {
        self.current.read().clone()
    }
}

/// Connects the live service to the audio pipelines.
pub struct LiveClient {
    inner: Arc<ClientInner>,
    lifecycle: tokio::sync::Mutex<()>,
    router: parking_lot::Mutex<Option<JoinHandle<()>>>,
    microphone: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl LiveClient {
    /// Create a builder.
    pub fn builder() -> LiveClientBuilder {
        LiveClientBuilder::new()
    }

    /// Open a new session, replacing the current one.
    ///
    /// Resumes playback first, then fetches a credential. On an auth
    /// failure the credential cache is cleared before the error is returned.
    pub async fn connect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let inner = &self.inner;

        inner.playback.resume().await?;

        let credential = inner.credentials.get_valid_token().await.inspect_err(|e| {
            if e.is_auth() {
                inner.credentials.clear_cache();
            }
        })?;

        self.teardown().await;

        let mut config = inner.config.read().clone();
        config.model = credential.model.clone();
        for declaration in inner.tools.declarations() {
            if !config.tools.iter().any(|t| t.name == declaration.name) {
                config.tools.push(declaration);
            }
        }

        let (session, events) = LiveSession::new(inner.endpoint.clone(), credential.token.clone());
        let session = Arc::new(session);
        info!(session_id = %session.id(), model = %config.model, "Connecting live session");

        let router = Router {
            session: Arc::downgrade(&session),
            playback: inner.playback.clone(),
            credentials: inner.credentials.clone(),
            tools: inner.tools.clone(),
            host: inner.host.clone(),
            running: HashMap::new(),
        };
        *self.router.lock() = Some(tokio::spawn(router.run(events)));
        *inner.current.write() = Some(session.clone());

        if let Err(e) = session.connect(&config).await {
            warn!(session_id = %session.id(), error = %e, "Live session failed to connect");
            if e.is_auth() {
                inner.credentials.clear_cache();
            }
            self.teardown().await;
            return Err(e);
        }
        Ok(())
    }

    /// Close the current session. Pipelines are left running for reuse.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown().await;
    }

    async fn teardown(&self) {
        let session = self.inner.current.write().take();
        if let Some(session) = session {
            debug!(session_id = %session.id(), "Disposing live session");
            session.disconnect().await;
        }

        let router = self.router.lock().take();
        if let Some(mut router) = router {
            if tokio::time::timeout(ROUTER_DRAIN_TIMEOUT, &mut router).await.is_err() {
                router.abort();
            }
        }
    }

    /// Replace the configuration used by the next connect.
    pub fn set_config(&self, config: SessionConfig) {
        *self.inner.config.write() = config;
    }

    /// Configuration used by the next connect.
    pub fn config(&self) -> SessionConfig {
        self.inner.config.read().clone()
    }

    /// State of the current session, `Idle` if there is none.
    pub fn state(&self) -> ConnectionState {
        self.inner.session().map(|s| s.state()).unwrap_or_default()
    }

    /// Whether a session is open.
    pub fn connected(&self) -> bool {
        self.state().is_open()
    }

    /// Output level in `[0, 1]`.
    pub fn volume(&self) -> f32 {
        self.inner.playback.volume()
    }

    /// Microphone level in `[0, 1]`; zero without a capture pipeline.
    pub fn input_volume(&self) -> f32 {
        self.inner.capture.as_ref().map(|c| c.volume()).unwrap_or(0.0)
    }

    /// Start the microphone and stream its blocks to the current session.
    pub async fn start_microphone(&self) -> Result<()> {
        let capture = self
            .inner
            .capture
            .as_ref()
            .ok_or_else(|| RealtimeError::config("no capture pipeline configured"))?;

        let blocks = capture.subscribe();
        capture.start().await?;

        let mut forwarder = self.microphone.lock();
        if forwarder.as_ref().is_none_or(|task| task.is_finished()) {
            *forwarder = Some(tokio::spawn(forward_microphone(self.inner.clone(), blocks)));
            debug!("Microphone forwarding started");
        }
        Ok(())
    }

    /// Stop the microphone and its forwarding.
    pub async fn stop_microphone(&self) {
        let forwarder = self.microphone.lock().take();
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        if let Some(capture) = &self.inner.capture {
            capture.stop().await;
        }
    }

    /// Send a user text turn.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(ClientMessage::text(text, true)).await
    }

    /// Answer tool calls the host handled itself.
    pub async fn send_tool_response(&self, responses: Vec<FunctionResponse>) -> Result<()> {
        self.send(ClientMessage::tool_response(responses)).await
    }

    /// Send a message on the current session.
    pub async fn send(&self, message: ClientMessage) -> Result<()> {
        let session = self.inner.session().ok_or(RealtimeError::NotConnected)?;
        session.send(message).await
    }
}

impl Drop for LiveClient {
    fn drop(&mut self) {
        if let Some(router) = self.router.get_mut().take() {
            router.abort();
        }
        if let Some(forwarder) = self.microphone.get_mut().take() {
            forwarder.abort();
        }
    }
}

impl std::fmt::Debug for LiveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveClient")
            .field("endpoint", &self.inner.endpoint.url())
            .field("state", &self.state())
            .field("tools", &self.inner.tools)
            .finish()
    }
}

/// Routes one session's events until it closes.
struct Router {
    session: Weak<LiveSession>,
    playback: Arc<PlaybackPipeline>,
    credentials: Arc<CredentialCache>,
    tools: Arc<ToolRegistry>,
    host: mpsc::UnboundedSender<SessionEvent>,
    /// Registered tool calls still running, by call id.
    running: HashMap<String, AbortHandle>,
}

impl Router {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            let event = match event {
                SessionEvent::Audio(bytes) => {
                    self.playback.add_pcm16(&bytes);
                    continue;
                }
                SessionEvent::ToolCall(call) => match self.dispatch_tools(call) {
                    Some(unhandled) => SessionEvent::ToolCall(unhandled),
                    None => continue,
                },
                other => other,
            };

            match &event {
                SessionEvent::Interrupted => self.playback.stop(),
                SessionEvent::TurnComplete => self.playback.flush(),
                SessionEvent::ToolCallCancellation { ids } => self.cancel_tools(ids),
                SessionEvent::Close(Some(reason)) if reason.is_auth() => {
                    warn!(%reason, "Credential rejected by the live service, clearing cache");
                    self.credentials.clear_cache();
                }
                _ => {}
            }

            let closed = matches!(event, SessionEvent::Close(_));
            self.forward(event);
            if closed {
                break;
            }
        }

        for (_, task) in self.running.drain() {
            task.abort();
        }
    }

    fn forward(&self, event: SessionEvent) {
        if self.host.send(event).is_err() {
            trace!("Host receiver dropped, event discarded");
        }
    }

    /// Run registered tools in the background, one task per call, each
    /// answering on its own. Returns the calls left for the host.
    fn dispatch_tools(&mut self, call: ToolCall) -> Option<ToolCall> {
        let (registered, unhandled): (Vec<_>, Vec<_>) =
            call.function_calls.into_iter().partition(|c| self.tools.contains(&c.name));

        self.running.retain(|_, task| !task.is_finished());
        for call in registered {
            let id = call.id.clone();
            let tools = self.tools.clone();
            let session = self.session.clone();
            let task = tokio::spawn(async move {
                let Some(response) = tools.execute(&call).await else { return };
                let Some(session) = session.upgrade() else { return };
                if let Err(e) = session.send(ClientMessage::tool_response(vec![response])).await {
                    warn!(error = %e, call_id = %call.id, "Failed to send tool response");
                }
            });
            self.running.insert(id, task.abort_handle());
        }

        (!unhandled.is_empty()).then_some(ToolCall { function_calls: unhandled })
    }

    /// Abort registered calls the server no longer wants answered.
    fn cancel_tools(&mut self, ids: &[String]) {
        for id in ids {
            if let Some(task) = self.running.remove(id) {
                task.abort();
                debug!(call_id = %id, "Tool call cancelled by the server");
            }
        }
    }
}

async fn forward_microphone(inner: Arc<ClientInner>, mut blocks: broadcast::Receiver<CaptureEvent>) {
    loop {
        match blocks.recv().await {
            Ok(CaptureEvent::Data { base64 }) => {
                let Some(session) = inner.session() else {
                    trace!("No live session, microphone block dropped");
                    continue;
                };
                if let Err(e) = session.send(ClientMessage::realtime_audio(base64)).await {
                    trace!(error = %e, "Microphone block dropped");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Microphone forwarding lagged, blocks dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Credential, CredentialSource};
    use crate::error::CredentialError;
    use async_trait::async_trait;
    use vox_audio::testing::ManualAudioContext;
    use vox_audio::{PlaybackOptions, UnitLoader};

    struct NeverSource;

    #[async_trait]
    impl CredentialSource for NeverSource {
        async fn fetch(&self, _model: &str) -> std::result::Result<Credential, CredentialError> {
            Err(CredentialError::Request("offline".into()))
        }
    }

    fn playback() -> Arc<PlaybackPipeline> {
        let context = Arc::new(ManualAudioContext::new(24_000));
        Arc::new(PlaybackPipeline::new(context, UnitLoader::shared(), PlaybackOptions::default()))
    }

    #[test]
    fn test_build_requires_parts() {
        assert!(LiveClient::builder().build().is_err());
        let credentials = Arc::new(CredentialCache::new(Arc::new(NeverSource), "m1"));
        let result = LiveClient::builder()
            .endpoint(LiveEndpoint::new("ws://127.0.0.1:1/live"))
            .credentials(credentials)
            .build();
        assert!(matches!(result, Err(RealtimeError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_credential_failure_does_not_open_a_session() {
        let credentials = Arc::new(CredentialCache::new(Arc::new(NeverSource), "m1"));
        let (client, _events) = LiveClient::builder()
            .endpoint(LiveEndpoint::new("ws://127.0.0.1:1/live"))
            .credentials(credentials)
            .playback(playback())
            .build()
            .unwrap();

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, RealtimeError::Credential(CredentialError::Request(_))));
        assert_eq!(client.state(), ConnectionState::Idle);
        assert!(matches!(client.send_text("hi").await, Err(RealtimeError::NotConnected)));
    }

    #[tokio::test]
    async fn test_microphone_requires_capture() {
        let credentials = Arc::new(CredentialCache::new(Arc::new(NeverSource), "m1"));
        let (client, _events) = LiveClient::builder()
            .endpoint(LiveEndpoint::new("ws://127.0.0.1:1/live"))
            .credentials(credentials)
            .playback(playback())
            .build()
            .unwrap();
        assert!(client.start_microphone().await.is_err());
        assert_eq!(client.input_volume(), 0.0);
    }
}
