//! Configuration types for live sessions.

use crate::error::{RealtimeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Response modality requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    /// Text parts.
    Text,
    /// Synthesized speech.
    Audio,
    /// Generated images.
    Image,
}

/// Tool/function declaration sent in the setup message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    /// Tool name.
    pub name: String,
    /// Tool description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl ToolDeclaration {
    /// Create a new tool declaration.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), description: None, parameters: None }
    }

    /// Set the tool description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Set the parameters schema.
    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = Some(schema);
        self
    }
}

/// Everything the setup message carries. Fixed for the lifetime of a
/// connection; changing it takes effect on the next `connect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Model identifier, or a fully qualified model resource name.
    pub model: String,

    /// Modalities the model should answer in.
    pub response_modalities: Vec<Modality>,

    /// Prebuilt voice name for audio output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// System instruction text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,

    /// Tools the model may call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDeclaration>,

    /// Temperature for response generation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum output tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            response_modalities: vec![Modality::Audio],
            voice: None,
            system_instruction: None,
            tools: Vec::new(),
            temperature: None,
            max_output_tokens: None,
        }
    }
}

impl SessionConfig {
    /// Create a configuration for `model` with audio responses.
    pub fn new(model: impl Into<String>) -> Self {
        Self { model: model.into(), ..Default::default() }
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set response modalities.
    pub fn with_modalities(mut self, modalities: Vec<Modality>) -> Self {
        self.response_modalities = modalities;
        self
    }

    /// Set the voice.
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    /// Set the system instruction.
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    /// Add a tool declaration.
    pub fn with_tool(mut self, tool: ToolDeclaration) -> Self {
        self.tools.push(tool);
        self
    }

    /// Set temperature.
    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp);
        self
    }

    /// Set maximum output tokens.
    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }

    /// Check the configuration can be sent.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(RealtimeError::config("model is required"));
        }
        if self.response_modalities.is_empty() {
            return Err(RealtimeError::config("at least one response modality is required"));
        }
        Ok(())
    }
}

/// Where the access token goes on the WebSocket handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TokenPlacement {
    /// `Authorization: Bearer <token>` header.
    #[default]
    BearerHeader,
    /// A query parameter with the given name.
    QueryParam(String),
}

/// The live service endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveEndpoint {
    url: String,
    token_placement: TokenPlacement,
}

impl LiveEndpoint {
    /// Endpoint at an explicit `ws://` or `wss://` URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), token_placement: TokenPlacement::default() }
    }

    /// Regional Vertex AI live endpoint.
    pub fn vertex(location: &str) -> Self {
        Self::new(format!(
            "wss://{location}-aiplatform.googleapis.com/ws/google.cloud.aiplatform.v1beta1.LlmBidiService/BidiGenerateContent"
        ))
    }

    /// Send the token as a query parameter instead of a header.
    pub fn with_query_token(mut self, param: impl Into<String>) -> Self {
        self.token_placement = TokenPlacement::QueryParam(param.into());
        self
    }

    /// Base URL, without any token.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// How the token is attached.
    pub fn token_placement(&self) -> &TokenPlacement {
        &self.token_placement
    }

    /// URL to dial for `token`. Only differs from [`url`](Self::url) for
    /// query-parameter placement.
    pub fn request_url(&self, token: &str) -> Result<Url> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| RealtimeError::config(format!("invalid endpoint URL '{}': {e}", self.url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(RealtimeError::config(format!("endpoint must be ws:// or wss://, got {}", url.scheme())));
        }
        if let TokenPlacement::QueryParam(name) = &self.token_placement {
            url.query_pairs_mut().append_pair(name, token);
        }
        Ok(url)
    }
}
