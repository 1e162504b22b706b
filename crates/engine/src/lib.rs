pub mod engine;
pub mod handler;
pub mod request;
pub mod resolve;
pub mod result;

pub use engine::{ToolEngine, ToolInfo};
pub use handler::{HandlerError, HandlerOutput, ToolHandler};
pub use request::ExecutionRequest;
pub use resolve::{check_path_allowlist, render_value, resolve_command};
pub use result::ExecutionResult;
