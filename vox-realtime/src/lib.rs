//! # vox-realtime
//!
//! Live voice sessions over WebSocket.
//!
//! ```text
//!   CredentialCache ──token──► LiveSession ◄──── JSON frames ────► live service
//!                                  │ events
//!                                  ▼
//!   CapturePipeline ──blocks──► LiveClient ──audio──► PlaybackPipeline
//!                                  │ everything else
//!                                  ▼
//!                                 host
//! ```
//!
//! - [`LiveSession`]: one connection and its state machine
//!   (`Idle → Connecting → Open → Closing → Closed`).
//! - [`CredentialCache`]: one short-lived token, refreshed ahead of expiry,
//!   shared by concurrent callers.
//! - [`LiveClient`]: owns the current session and wires it to the audio
//!   pipelines and tool handlers.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vox_realtime::{CredentialCache, HttpCredentialSource, LiveClient, LiveEndpoint, SessionConfig};
//!
//! let source = HttpCredentialSource::new(token_url, Some(api_token)).with_location("us-central1");
//! let credentials = Arc::new(CredentialCache::new(Arc::new(source), "gemini-live-2.5-flash"));
//!
//! let (client, mut events) = LiveClient::builder()
//!     .endpoint(LiveEndpoint::vertex("us-central1"))
//!     .credentials(credentials)
//!     .playback(playback)
//!     .capture(capture)
//!     .config(SessionConfig::default().with_voice("Puck"))
//!     .build()?;
//!
//! client.connect().await?;
//! client.start_microphone().await?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod protocol;
pub mod session;
pub mod tools;

pub use client::{LiveClient, LiveClientBuilder};
pub use config::{LiveEndpoint, Modality, SessionConfig, TokenPlacement, ToolDeclaration};
pub use credentials::{Credential, CredentialCache, CredentialSource, HttpCredentialSource};
pub use error::{CredentialError, RealtimeError, Result};
pub use events::{AUTH_CLOSE_CODES, CloseReason, ConnectionState, SessionEvent};
pub use protocol::{ClientMessage, FunctionCall, FunctionResponse, ServerContent, ServerMessage, ToolCall};
pub use session::LiveSession;
pub use tools::{FnToolHandler, ToolHandler, ToolRegistry};
