//! Wires the desktop audio backend, the credential endpoint and the live
//! client together for the terminal commands.

use crate::config::Settings;
use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use vox_audio::desktop::{CpalAudioContext, CpalMicrophone};
use vox_audio::{CaptureOptions, CapturePipeline, PlaybackOptions, PlaybackPipeline, UnitLoader};
use vox_realtime::{
    CloseReason, CredentialCache, FunctionCall, HttpCredentialSource, LiveClient, SessionEvent, ToolDeclaration,
};

pub struct Live {
    pub client: LiveClient,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

pub fn credential_cache(settings: &Settings) -> Arc<CredentialCache> {
    let source = HttpCredentialSource::new(settings.credential_url.clone(), settings.credential_token.clone())
        .with_location(settings.location.clone());
    Arc::new(CredentialCache::new(Arc::new(source), settings.model.clone()))
}

/// Build a client on the default output device, and the default input
/// device when `microphone` is set.
pub fn build(settings: &Settings, microphone: bool) -> Result<Live> {
    let loader = UnitLoader::shared();
    let playback = Arc::new(PlaybackPipeline::new(
        Arc::new(CpalAudioContext::new(PlaybackOptions::default().sample_rate)),
        loader.clone(),
        PlaybackOptions::default(),
    ));

    let mut builder = LiveClient::builder()
        .endpoint(settings.endpoint())
        .credentials(credential_cache(settings))
        .playback(playback)
        .config(settings.session_config())
        .tool_fn(
            ToolDeclaration::new("get_current_time")
                .with_description("Current date and time in UTC, RFC 3339")
                .with_parameters(json!({"type": "object", "properties": {}})),
            |_: &FunctionCall| Ok(json!({ "utc": chrono::Utc::now().to_rfc3339() })),
        );

    if microphone {
        let options = CaptureOptions::default();
        let capture = CapturePipeline::new(
            Arc::new(CpalAudioContext::new(options.sample_rate)),
            Arc::new(CpalMicrophone::new()),
            loader,
            options,
        );
        builder = builder.capture(capture);
    }

    let (client, events) = builder.build().context("failed to build live client")?;
    Ok(Live { client, events })
}

/// Print session events until the session closes. Returns the close reason.
pub async fn render_events(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Option<CloseReason> {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::SetupComplete => println!("[connected]"),
            SessionEvent::ServerContent(content) => {
                if let Some(t) = content.input_transcription {
                    println!("you   > {}", t.text);
                }
                if let Some(t) = content.output_transcription {
                    println!("model > {}", t.text);
                }
                for part in content.model_turn.into_iter().flat_map(|turn| turn.parts) {
                    if let Some(text) = part.text {
                        println!("model > {text}");
                    }
                }
            }
            SessionEvent::Interrupted => println!("[interrupted]"),
            SessionEvent::ToolCall(call) => {
                for f in call.function_calls {
                    tracing::warn!(tool = %f.name, call_id = %f.id, "Model called an unknown tool");
                }
            }
            SessionEvent::GoAway { time_left } => {
                tracing::warn!(?time_left, "Server will close the session soon");
            }
            SessionEvent::Usage(usage) => {
                tracing::debug!(total_tokens = ?usage.total_token_count, "Usage");
            }
            SessionEvent::Close(reason) => return reason,
            SessionEvent::Open
            | SessionEvent::Audio(_)
            | SessionEvent::TurnComplete
            | SessionEvent::ToolCallCancellation { .. } => {}
        }
    }
    None
}

/// Turn an abnormal close into an error for the exit status.
pub fn check_close(reason: Option<CloseReason>) -> Result<()> {
    match reason {
        None => Ok(()),
        Some(reason) if reason.is_auth() => {
            anyhow::bail!("{reason}; the cached credential was discarded, run again to fetch a new one")
        }
        Some(reason) => anyhow::bail!("session ended: {reason}"),
    }
}
