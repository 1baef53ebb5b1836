//! Events and connection state surfaced by a live session.

use crate::protocol::{ServerContent, ToolCall, UsageMetadata};
use bytes::Bytes;

/// WebSocket close codes that mean the credential was rejected:
/// policy violation plus the two application-range auth codes.
pub const AUTH_CLOSE_CODES: [u16; 3] = [1008, 4001, 4003];

/// Events delivered to subscribers, in receipt order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The socket is open and the setup message has been sent.
    Open,
    /// The server accepted the setup; content may flow.
    SetupComplete,
    /// Non-audio model output, transcriptions and generation markers.
    ServerContent(ServerContent),
    /// Raw PCM16 (24 kHz, little-endian) from the model.
    Audio(Bytes),
    /// The model turn was abandoned, typically because the user spoke.
    Interrupted,
    /// The model finished its turn.
    TurnComplete,
    /// The model wants tools run.
    ToolCall(ToolCall),
    /// Previously requested tool calls are no longer wanted.
    ToolCallCancellation {
        /// Ids of the cancelled calls.
        ids: Vec<String>,
    },
    /// The server will drop the connection soon.
    GoAway {
        /// Remaining time as reported by the server (e.g. `"10s"`).
        time_left: Option<String>,
    },
    /// Token accounting.
    Usage(UsageMetadata),
    /// The connection ended. `None` for a clean close.
    Close(Option<CloseReason>),
}

/// Why a connection ended abnormally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The credential was rejected during the handshake or by a close code.
    Auth {
        /// Close code, or the HTTP status for handshake rejections.
        code: Option<u16>,
        /// Reason text from the server.
        reason: String,
    },
    /// The transport failed.
    Network(String),
    /// The server closed with a non-auth error code.
    Remote {
        /// Close code.
        code: u16,
        /// Reason text from the server.
        reason: String,
    },
}

impl CloseReason {
    /// Classify a close frame. Normal closure yields `None`.
    pub fn from_close_code(code: u16, reason: impl Into<String>) -> Option<Self> {
        let reason = reason.into();
        match code {
            1000 => None,
            c if AUTH_CLOSE_CODES.contains(&c) => Some(Self::Auth { code: Some(c), reason }),
            c => Some(Self::Remote { code: c, reason }),
        }
    }

    /// Whether the host should re-authenticate before retrying.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auth { code: Some(code), reason } => write!(f, "authentication rejected ({code}): {reason}"),
            Self::Auth { code: None, reason } => write!(f, "authentication rejected: {reason}"),
            Self::Network(reason) => write!(f, "network failure: {reason}"),
            Self::Remote { code, reason } => write!(f, "closed by server ({code}): {reason}"),
        }
    }
}

/// Lifecycle of one protocol session.
///
/// `Idle → Connecting → Open → Closing → Closed`. Interruption is an event
/// during `Open`, not a state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    Closed(Option<CloseReason>),
}

impl ConnectionState {
    /// Whether messages can be sent (possibly queued until setup completes).
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Whether the session has finished for good.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}
