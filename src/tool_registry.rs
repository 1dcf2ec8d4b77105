//! Tool Registry (spec §6): an external collaborator the Tool Orchestrator
//! invokes to actually run model-requested function calls. No concrete
//! implementation ships with this crate -- applications bring their own
//! functions and register them.

use async_trait::async_trait;
use serde_json::Value;

/// One function the model may call.
#[derive(Debug, Clone)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
}

/// One call the model emitted, extracted from a `functionCall` part.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    pub args: Value,
}

/// Result of running one [`ToolCall`].
#[derive(Debug, Clone)]
pub struct ToolCallResult {
    pub call_id: String,
    pub content: Value,
    pub is_error: bool,
}

/// Registry of callable tools, implemented by the application embedding
/// this client. `execute` is invoked by the Tool Orchestrator (spec §4.K)
/// under its own supervisor, never as a bare unsupervised task.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    fn register(&mut self, declaration: FunctionDeclaration, callback: ToolCallback);

    async fn execute(&self, calls: Vec<ToolCall>) -> Result<Vec<ToolCallResult>, ToolExecutionError>;

    fn declarations(&self) -> Vec<FunctionDeclaration>;
}

pub type ToolCallback = Box<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

#[derive(Debug, Clone, thiserror::Error)]
#[error("tool execution failed: {reason}")]
pub struct ToolExecutionError {
    pub reason: String,
}
