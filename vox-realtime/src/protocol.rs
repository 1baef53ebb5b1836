//! Wire format of the live protocol.
//!
//! Every frame is a JSON object with exactly one top-level key naming the
//! message kind, e.g. `{"setup": {...}}` or `{"serverContent": {...}}`.

use crate::config::{Modality, SessionConfig, ToolDeclaration};
use crate::error::{RealtimeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use vox_audio::AudioFormat;

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// First message on every connection.
    Setup(Setup),
    /// Streaming microphone input.
    RealtimeInput(RealtimeInput),
    /// Conversation turns (text).
    ClientContent(ClientContent),
    /// Results of tool calls.
    ToolResponse(ToolResponse),
}

impl ClientMessage {
    /// Build the setup message for `config`.
    pub fn setup(config: &SessionConfig) -> Self {
        let speech_config = config.voice.as_ref().map(|voice| SpeechConfig {
            voice_config: VoiceConfig { prebuilt_voice_config: PrebuiltVoiceConfig { voice_name: voice.clone() } },
        });

        Self::Setup(Setup {
            model: config.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: config.response_modalities.clone(),
                speech_config,
                temperature: config.temperature,
                max_output_tokens: config.max_output_tokens,
            },
            system_instruction: config
                .system_instruction
                .as_ref()
                .map(|text| Content { role: None, parts: vec![Part::text(text.clone())] }),
            tools: convert_tools(&config.tools),
        })
    }

    /// One base64 PCM16 block of microphone audio at 16 kHz.
    pub fn realtime_audio(base64: impl Into<String>) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: AudioFormat::pcm16_16khz().mime_type(),
                data: base64.into(),
            }],
        })
    }

    /// A single user text turn.
    pub fn text(text: impl Into<String>, turn_complete: bool) -> Self {
        Self::ClientContent(ClientContent {
            turns: vec![Content { role: Some("user".to_string()), parts: vec![Part::text(text.into())] }],
            turn_complete,
        })
    }

    /// Responses to one or more tool calls.
    pub fn tool_response(function_responses: Vec<FunctionResponse>) -> Self {
        Self::ToolResponse(ToolResponse { function_responses })
    }

    /// Message kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Setup(_) => "setup",
            Self::RealtimeInput(_) => "realtimeInput",
            Self::ClientContent(_) => "clientContent",
            Self::ToolResponse(_) => "toolResponse",
        }
    }

    /// Serialize to the JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Session setup payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

/// Base64 payload with its MIME type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

/// Result of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    /// Id of the call being answered.
    pub id: String,
    /// Tool name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Result object.
    pub response: Value,
}

impl FunctionResponse {
    /// Response for call `id`. Bare strings are wrapped as `{"result": ...}`.
    pub fn new(id: impl Into<String>, response: Value) -> Self {
        let response = match response {
            Value::String(s) => json!({ "result": s }),
            other => other,
        };
        Self { id: id.into(), name: None, response }
    }

    /// Attach the tool name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A turn: a role and its parts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// One part of a turn. Part kinds this crate does not model are kept in `other`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<MediaChunk>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl Part {
    /// A text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), ..Default::default() }
    }

    /// Whether this part carries PCM audio.
    pub fn is_audio(&self) -> bool {
        self.inline_data.as_ref().is_some_and(|d| d.mime_type.starts_with("audio/pcm"))
    }
}

/// Body of a `serverContent` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub generation_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_transcription: Option<Transcription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_transcription: Option<Transcription>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

/// Body of a `toolCall` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

/// One requested function invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default = "empty_object")]
    pub args: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Token accounting reported by the service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: Option<u32>,
    #[serde(default)]
    pub response_token_count: Option<u32>,
    #[serde(default)]
    pub total_token_count: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerMessage {
    setup_complete: Option<Value>,
    server_content: Option<ServerContent>,
    tool_call: Option<ToolCall>,
    tool_call_cancellation: Option<RawCancellation>,
    go_away: Option<RawGoAway>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCancellation {
    #[serde(default)]
    ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGoAway {
    time_left: Option<String>,
}

/// Inbound messages, one per top-level key.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    SetupComplete,
    ServerContent(ServerContent),
    ToolCall(ToolCall),
    ToolCallCancellation { ids: Vec<String> },
    GoAway { time_left: Option<String> },
    Usage(UsageMetadata),
}

impl ServerMessage {
    /// Parse one frame. Usage metadata may ride along with content, so a
    /// frame can yield more than one message; an empty result means the
    /// frame had nothing this client understands.
    pub fn parse(raw: &str) -> Result<Vec<ServerMessage>> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| RealtimeError::protocol(format!("invalid JSON frame: {e}")))?;
        if !value.is_object() {
            return Err(RealtimeError::protocol("frame is not a JSON object"));
        }
        let message: RawServerMessage = serde_json::from_value(value)
            .map_err(|e| RealtimeError::protocol(format!("malformed server message: {e}")))?;

        let mut out = Vec::new();
        if message.setup_complete.is_some() {
            out.push(ServerMessage::SetupComplete);
        }
        if let Some(content) = message.server_content {
            out.push(ServerMessage::ServerContent(content));
        }
        if let Some(call) = message.tool_call {
            out.push(ServerMessage::ToolCall(call));
        }
        if let Some(cancel) = message.tool_call_cancellation {
            out.push(ServerMessage::ToolCallCancellation { ids: cancel.ids });
        }
        if let Some(go_away) = message.go_away {
            out.push(ServerMessage::GoAway { time_left: go_away.time_left });
        }
        if let Some(usage) = message.usage_metadata {
            out.push(ServerMessage::Usage(usage));
        }
        Ok(out)
    }
}

fn convert_tools(tools: &[ToolDeclaration]) -> Option<Vec<Value>> {
    if tools.is_empty() {
        return None;
    }
    let function_declarations: Vec<Value> = tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description.clone().unwrap_or_default(),
                "parameters": t.parameters.clone().unwrap_or_else(|| json!({ "type": "object", "properties": {} }))
            })
        })
        .collect();

    Some(vec![json!({ "functionDeclarations": function_declarations })])
}
