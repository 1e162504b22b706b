use serde_json::Value;

use toolgate_executor::{ExecOutcome, EXIT_FAILURE};

/// Terminal shape of one request. Every path through the engine ends
/// here; protocol errors are the only thing reported some other way.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub request_id: String,
    pub ok: bool,
    pub needs_confirmation: bool,
    pub summary: String,
    pub data: Option<Value>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub elapsed_ms: u64,
    pub timed_out: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub(crate) fn base(request_id: String) -> Self {
        Self {
            request_id,
            ok: false,
            needs_confirmation: false,
            summary: String::new(),
            data: None,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            elapsed_ms: 0,
            timed_out: false,
            stdout_truncated: false,
            stderr_truncated: false,
            stdout_bytes: 0,
            stderr_bytes: 0,
            error: None,
        }
    }

    pub fn failure(
        request_id: impl Into<String>,
        summary: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let mut result = Self::base(request_id.into());
        result.summary = summary.into();
        result.error = Some(error.into());
        result.exit_code = EXIT_FAILURE;
        result
    }

    /// The confirmation gate is a clean stop, not an error: exit code
    /// stays zero and only the flag tells the caller to retry with
    /// consent attached.
    pub fn need_confirm(
        request_id: impl Into<String>,
        summary: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        let mut result = Self::base(request_id.into());
        result.summary = summary.into();
        result.needs_confirmation = true;
        result.data = data;
        result
    }

    pub fn from_outcome(request_id: impl Into<String>, tool: &str, outcome: ExecOutcome) -> Self {
        let (summary, error) = if outcome.success {
            (format!("{tool} succeeded in {}ms", outcome.duration_ms), None)
        } else if outcome.timed_out {
            (
                format!("{tool} timed out after {}ms", outcome.duration_ms),
                Some("timeout".to_string()),
            )
        } else {
            (
                format!("{tool} failed with exit code {}", outcome.exit_code),
                Some(format!("exit code {}", outcome.exit_code)),
            )
        };
        Self {
            request_id: request_id.into(),
            ok: outcome.success,
            needs_confirmation: false,
            summary,
            data: None,
            stdout: outcome.stdout.text,
            stderr: outcome.stderr.text,
            exit_code: outcome.exit_code,
            elapsed_ms: outcome.duration_ms,
            timed_out: outcome.timed_out,
            stdout_truncated: outcome.stdout.truncated,
            stderr_truncated: outcome.stderr.truncated,
            stdout_bytes: outcome.stdout.original_bytes,
            stderr_bytes: outcome.stderr.original_bytes,
            error,
        }
    }
}
