use serde_json::{Map, Value};

use toolgate_policy::CONFIRM_ARG_KEY;

/// One tool invocation as the engine sees it.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub tool: String,
    pub args: Map<String, Value>,
    pub confirmed: bool,
}

impl ExecutionRequest {
    pub fn new(tool: impl Into<String>, args: Map<String, Value>) -> Self {
        Self { tool: tool.into(), args, confirmed: false }
    }

    /// Builds a request from raw wire arguments, peeling off the
    /// reserved confirmation key so it never reaches schema validation
    /// or a command line. Only a literal boolean `true` counts as
    /// confirmation.
    pub fn from_wire(tool: impl Into<String>, mut args: Map<String, Value>) -> Self {
        let confirmed = matches!(args.remove(CONFIRM_ARG_KEY), Some(Value::Bool(true)));
        Self { tool: tool.into(), args, confirmed }
    }

    pub fn confirmed(mut self) -> Self {
        self.confirmed = true;
        self
    }
}
