pub mod definition;
pub mod schema;
pub mod store;

pub use definition::{placeholders, NotifyTrigger, ToolBackend, ToolDefinition};
pub use schema::{validate_args, ArgsSchema, Pattern, PropType, PropertySpec, SchemaError, Violation};
pub use store::{
    Policy, PolicyConfig, PolicyError, PolicyStore, SecurityConfig, CONFIRM_ARG_KEY,
    DEFAULT_OUTPUT_LIMIT_BYTES, DEFAULT_TIMEOUT_SEC,
};
