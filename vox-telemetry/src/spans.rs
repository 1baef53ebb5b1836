//! Span helpers for live voice operations
//!
//! Pre-configured spans so every crate names the same operation the same way.

use tracing::Span;

/// Span covering one live session, from dial to close.
///
/// # Example
/// ```
/// use vox_telemetry::live_session_span;
/// let span = live_session_span("5f0c", "gemini-live");
/// let _enter = span.enter();
/// ```
pub fn live_session_span(session_id: &str, model: &str) -> Span {
    tracing::info_span!("live.session", session.id = session_id, model.name = model, otel.kind = "client")
}

/// Span for a credential refresh against the issuing service.
pub fn credential_refresh_span(model: &str, attempt: usize) -> Span {
    tracing::info_span!("credential.refresh", model.name = model, attempt, otel.kind = "client")
}

/// Span for tool execution
///
/// # Example
/// ```
/// use vox_telemetry::tool_execute_span;
/// let span = tool_execute_span("weather", "call-1");
/// let _enter = span.enter();
/// ```
pub fn tool_execute_span(tool_name: &str, call_id: &str) -> Span {
    tracing::info_span!("tool.execute", tool.name = tool_name, tool.call_id = call_id, otel.kind = "internal")
}
