//! Tool handlers run on behalf of the model.

use crate::config::ToolDeclaration;
use crate::error::Result;
use crate::protocol::{FunctionCall, FunctionResponse};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{Instrument, debug, warn};
use vox_telemetry::tool_execute_span;

/// Handler for tool/function calls from the live model.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute a tool call and return the result.
    async fn execute(&self, call: &FunctionCall) -> Result<Value>;
}

/// A simple function-based tool handler.
pub struct FnToolHandler<F>
where
    F: Fn(&FunctionCall) -> Result<Value> + Send + Sync,
{
    handler: F,
}

impl<F> FnToolHandler<F>
where
    F: Fn(&FunctionCall) -> Result<Value> + Send + Sync,
{
    /// Create a new function-based tool handler.
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F> ToolHandler for FnToolHandler<F>
where
    F: Fn(&FunctionCall) -> Result<Value> + Send + Sync,
{
    async fn execute(&self, call: &FunctionCall) -> Result<Value> {
        (self.handler)(call)
    }
}

/// Registered tools, keyed by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, (ToolDeclaration, Arc<dyn ToolHandler>)>,
}

impl ToolRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `declaration.name`, replacing any previous one.
    pub fn register(&mut self, declaration: ToolDeclaration, handler: Arc<dyn ToolHandler>) {
        self.tools.insert(declaration.name.clone(), (declaration, handler));
    }

    /// Whether a handler exists for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Declarations to advertise in the setup message.
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        let mut declarations: Vec<_> = self.tools.values().map(|(decl, _)| decl.clone()).collect();
        declarations.sort_by(|a, b| a.name.cmp(&b.name));
        declarations
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Run the handler for `call`. Handler failures become `{"error": msg}`
    /// so the model always gets an answer. `None` if the tool is unknown.
    pub async fn execute(&self, call: &FunctionCall) -> Option<FunctionResponse> {
        let (_, handler) = self.tools.get(&call.name)?;
        debug!(tool = %call.name, call_id = %call.id, "Executing tool");
        let outcome = handler.execute(call).instrument(tool_execute_span(&call.name, &call.id)).await;
        let response = match outcome {
            Ok(value) => value,
            Err(e) => {
                warn!(tool = %call.name, call_id = %call.id, error = %e, "Tool execution failed");
                serde_json::json!({ "error": e.to_string() })
            }
        };
        Some(FunctionResponse::new(call.id.clone(), response).with_name(call.name.clone()))
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry").field("tools", &self.tools.keys().collect::<Vec<_>>()).finish()
    }
}
