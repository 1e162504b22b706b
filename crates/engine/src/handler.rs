use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// Successful handler result: a short human summary plus optional
/// structured payload for the caller.
#[derive(Debug, Clone, Default)]
pub struct HandlerOutput {
    pub summary: String,
    pub data: Option<Value>,
}

impl HandlerOutput {
    pub fn new(summary: impl Into<String>) -> Self {
        Self { summary: summary.into(), data: None }
    }

    pub fn with_data(summary: impl Into<String>, data: Value) -> Self {
        Self { summary: summary.into(), data: Some(data) }
    }
}

/// Failure reported by a handler. Carries only a message; handlers that
/// need richer error detail fold it into the data they return instead.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// In-process implementation behind a `handler:` tool. Arguments arrive
/// already validated against the tool's schema.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, args: &Map<String, Value>) -> Result<HandlerOutput, HandlerError>;
}
