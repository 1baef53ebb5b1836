//! Protocol session tests against an in-process WebSocket server.

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::future::Future;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};
use vox_realtime::{
    ClientMessage, CloseReason, ConnectionState, LiveEndpoint, LiveSession, RealtimeError, SessionConfig,
    SessionEvent,
};

#[derive(Debug)]
struct Handshake {
    uri: String,
    authorization: Option<String>,
}

/// Accept one connection and hand it to `script`.
async fn spawn_server<F, Fut>(script: F) -> (String, oneshot::Receiver<Handshake>)
where
    F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (handshake_tx, handshake_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let _ = handshake_tx.send(Handshake {
                uri: req.uri().to_string(),
                authorization: req
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
            });
            Ok(resp)
        };
        let ws = accept_hdr_async(stream, callback).await.unwrap();
        script(ws).await;
    });

    (format!("ws://{addr}/live"), handshake_rx)
}

/// Forward every text frame the client sends to `frames` until it hangs up.
async fn record_frames(
    mut read: futures::stream::SplitStream<WebSocketStream<TcpStream>>,
    frames: mpsc::UnboundedSender<Value>,
) {
    while let Some(Ok(message)) = read.next().await {
        if let Message::Text(text) = message {
            let _ = frames.send(serde_json::from_str(text.as_str()).unwrap());
        }
    }
}

fn text(value: Value) -> Message {
    Message::Text(value.to_string().into())
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn next_frame(frames: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(Duration::from_secs(5), frames.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("frame channel closed")
}

#[tokio::test]
async fn test_setup_is_first_and_early_sends_are_queued() {
    let (frames_tx, mut frames) = mpsc::unbounded_channel();
    let (go_tx, go_rx) = oneshot::channel::<()>();

    let (url, handshake) = spawn_server(move |ws| async move {
        let (mut write, read) = ws.split();
        let recorder = tokio::spawn(record_frames(read, frames_tx));
        let _ = go_rx.await;
        write.send(text(json!({"setupComplete": {}}))).await.unwrap();
        let _ = recorder.await;
    })
    .await;

    let (session, mut events) = LiveSession::new(LiveEndpoint::new(url), "tok-123");
    session.connect(&SessionConfig::new("m1")).await.unwrap();

    let handshake = handshake.await.unwrap();
    assert_eq!(handshake.authorization.as_deref(), Some("Bearer tok-123"));
    assert_eq!(next_event(&mut events).await, SessionEvent::Open);

    let setup = next_frame(&mut frames).await;
    assert_eq!(setup["setup"]["model"], "m1");

    session.send(ClientMessage::text("first", false)).await.unwrap();
    session.send(ClientMessage::text("second", true)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(frames.try_recv().is_err(), "nothing may be sent before setupComplete");
    assert!(!session.is_setup_complete());

    go_tx.send(()).unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::SetupComplete);

    let first = next_frame(&mut frames).await;
    let second = next_frame(&mut frames).await;
    assert_eq!(first["clientContent"]["turns"][0]["parts"][0]["text"], "first");
    assert_eq!(second["clientContent"]["turns"][0]["parts"][0]["text"], "second");
    assert_eq!(second["clientContent"]["turnComplete"], true);

    // After setup, sends go straight out.
    session.send(ClientMessage::realtime_audio("AAA=")).await.unwrap();
    let audio = next_frame(&mut frames).await;
    assert_eq!(audio["realtimeInput"]["mediaChunks"][0]["data"], "AAA=");
}

#[tokio::test]
async fn test_inbound_messages_are_demultiplexed_in_order() {
    let (url, _) = spawn_server(|ws| async move {
        let (mut write, mut read) = ws.split();
        let _setup = read.next().await;

        // Content before setupComplete is dropped.
        write
            .send(text(json!({"serverContent": {"modelTurn": {"parts": [{"text": "too early"}]}}})))
            .await
            .unwrap();
        write.send(text(json!({"setupComplete": {}}))).await.unwrap();
        write
            .send(text(json!({"serverContent": {"modelTurn": {"parts": [
                {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAE="}},
                {"text": "hello"}
            ]}}})))
            .await
            .unwrap();
        write.send(text(json!({"someFutureMessage": {"x": 1}}))).await.unwrap();
        write.send(Message::Binary(json!({"serverContent": {"turnComplete": true}}).to_string().into())).await.unwrap();
        write.send(text(json!({"serverContent": {"interrupted": true, "turnComplete": true}}))).await.unwrap();
        write
            .send(text(json!({"toolCall": {"functionCalls": [{"id": "c1", "name": "lookup", "args": {"q": "x"}}]}})))
            .await
            .unwrap();
        write.send(text(json!({"toolCallCancellation": {"ids": ["c1"]}}))).await.unwrap();
        write.send(text(json!({"goAway": {"timeLeft": "10s"}}))).await.unwrap();
        write
            .send(Message::Close(Some(CloseFrame { code: CloseCode::Normal, reason: "done".into() })))
            .await
            .unwrap();
        while read.next().await.is_some() {}
    })
    .await;

    let (session, mut events) = LiveSession::new(LiveEndpoint::new(url), "tok");
    session.connect(&SessionConfig::new("m1")).await.unwrap();

    assert_eq!(next_event(&mut events).await, SessionEvent::Open);
    assert_eq!(next_event(&mut events).await, SessionEvent::SetupComplete);
    assert_eq!(next_event(&mut events).await, SessionEvent::Audio(bytes::Bytes::from_static(&[0x00, 0x01])));
    let SessionEvent::ServerContent(content) = next_event(&mut events).await else {
        panic!("expected server content");
    };
    let parts = content.model_turn.unwrap().parts;
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].text.as_deref(), Some("hello"));

    assert_eq!(next_event(&mut events).await, SessionEvent::TurnComplete);
    assert_eq!(next_event(&mut events).await, SessionEvent::Interrupted);

    let SessionEvent::ToolCall(call) = next_event(&mut events).await else { panic!("expected tool call") };
    assert_eq!(call.function_calls[0].name, "lookup");
    assert_eq!(call.function_calls[0].args, json!({"q": "x"}));

    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::ToolCallCancellation { ids: vec!["c1".to_string()] }
    );
    assert_eq!(next_event(&mut events).await, SessionEvent::GoAway { time_left: Some("10s".to_string()) });
    assert_eq!(next_event(&mut events).await, SessionEvent::Close(None));
    assert_eq!(session.state(), ConnectionState::Closed(None));
}

#[tokio::test]
async fn test_auth_close_code_is_classified() {
    let (url, _) = spawn_server(|ws| async move {
        let (mut write, mut read) = ws.split();
        let _setup = read.next().await;
        write
            .send(Message::Close(Some(CloseFrame { code: CloseCode::from(4001), reason: "token expired".into() })))
            .await
            .unwrap();
        while read.next().await.is_some() {}
    })
    .await;

    let (session, mut events) = LiveSession::new(LiveEndpoint::new(url), "stale");
    session.connect(&SessionConfig::new("m1")).await.unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::Open);

    let SessionEvent::Close(Some(reason)) = next_event(&mut events).await else { panic!("expected close") };
    assert!(reason.is_auth());
    assert_eq!(reason, CloseReason::Auth { code: Some(4001), reason: "token expired".into() });
    assert!(matches!(session.send(ClientMessage::text("hi", true)).await, Err(RealtimeError::NotConnected)));
}

#[tokio::test]
async fn test_remote_error_close_is_not_auth() {
    let (url, _) = spawn_server(|ws| async move {
        let (mut write, mut read) = ws.split();
        let _setup = read.next().await;
        write
            .send(Message::Close(Some(CloseFrame { code: CloseCode::Error, reason: "internal".into() })))
            .await
            .unwrap();
        while read.next().await.is_some() {}
    })
    .await;

    let (session, mut events) = LiveSession::new(LiveEndpoint::new(url), "tok");
    session.connect(&SessionConfig::new("m1")).await.unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::Open);
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Close(Some(CloseReason::Remote { code: 1011, reason: "internal".into() }))
    );
}

#[tokio::test]
async fn test_handshake_401_is_an_auth_error() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 2048];
        let _ = stream.read(&mut buf).await;
        let _ = stream.write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\n\r\n").await;
    });

    let (session, mut events) = LiveSession::new(LiveEndpoint::new(format!("ws://{addr}/live")), "bad");
    let err = session.connect(&SessionConfig::new("m1")).await.unwrap_err();
    assert!(err.is_auth(), "expected auth error, got {err}");

    let SessionEvent::Close(Some(reason)) = next_event(&mut events).await else { panic!("expected close") };
    assert!(reason.is_auth());
    assert!(session.state().is_closed());
}

#[tokio::test]
async fn test_unreachable_endpoint_is_a_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (session, mut events) = LiveSession::new(LiveEndpoint::new(format!("ws://{addr}/live")), "tok");
    let err = session.connect(&SessionConfig::new("m1")).await.unwrap_err();
    assert!(matches!(err, RealtimeError::ConnectionError(_)));
    assert!(matches!(next_event(&mut events).await, SessionEvent::Close(Some(CloseReason::Network(_)))));
}

#[tokio::test]
async fn test_query_token_placement() {
    let (url, handshake) = spawn_server(|ws| async move {
        let (_write, mut read) = ws.split();
        while read.next().await.is_some() {}
    })
    .await;

    let endpoint = LiveEndpoint::new(url).with_query_token("access_token");
    let (session, _events) = LiveSession::new(endpoint, "tok-9");
    session.connect(&SessionConfig::new("m1")).await.unwrap();

    let handshake = handshake.await.unwrap();
    assert_eq!(handshake.authorization, None);
    assert!(handshake.uri.ends_with("/live?access_token=tok-9"), "uri was {}", handshake.uri);
}

#[tokio::test]
async fn test_disconnect_emits_one_clean_close() {
    let (url, _) = spawn_server(|ws| async move {
        let (mut write, mut read) = ws.split();
        let _setup = read.next().await;
        write.send(text(json!({"setupComplete": {}}))).await.unwrap();
        while read.next().await.is_some() {}
    })
    .await;

    let (session, mut events) = LiveSession::new(LiveEndpoint::new(url), "tok");
    session.connect(&SessionConfig::new("m1")).await.unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::Open);
    assert_eq!(next_event(&mut events).await, SessionEvent::SetupComplete);

    session.disconnect().await;
    session.disconnect().await;

    assert_eq!(next_event(&mut events).await, SessionEvent::Close(None));
    assert_eq!(session.state(), ConnectionState::Closed(None));
    let extra = tokio::time::timeout(Duration::from_millis(100), events.recv()).await;
    assert!(matches!(extra, Err(_) | Ok(None)), "only one close event expected");

    let again = session.connect(&SessionConfig::new("m1")).await;
    assert!(matches!(again, Err(RealtimeError::InvalidState(_))));
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_dialing() {
    let (session, _events) = LiveSession::new(LiveEndpoint::new("ws://127.0.0.1:9/live"), "tok");
    let err = session.connect(&SessionConfig::default()).await.unwrap_err();
    assert!(matches!(err, RealtimeError::ConfigError(_)));
    assert_eq!(session.state(), ConnectionState::Idle);
}
