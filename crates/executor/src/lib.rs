pub mod capture;
pub mod executor;
pub mod process_group;

pub use capture::{StreamOutput, TRUNCATION_MARKER_PREFIX};
pub use executor::{
    ExecError, ExecOutcome, ExecSpec, ResourceExecutor, EXIT_FAILURE, EXIT_NOT_FOUND,
    EXIT_PERMISSION_DENIED, EXIT_TIMEOUT,
};
pub use process_group::ProcessGroup;
