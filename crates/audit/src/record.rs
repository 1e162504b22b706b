use serde::{Deserialize, Serialize};

/// Terminal outcome classes, mirrored by the notification triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Ok,
    Fail,
    NeedConfirm,
}

/// One line in the audit trail: a single execution attempt, whether it
/// ran, was rejected, or stopped at the confirmation gate. Raw argument
/// values never appear here, only their sanitized hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: String,
    pub request_id: String,
    pub tool: String,
    pub caller: String,
    pub status: AuditStatus,
    pub args_hash: String,
    pub mutates: bool,
    pub requires_confirm: bool,
    pub exit_code: i32,
    pub elapsed_ms: u64,
    pub stdout_dropped_bytes: u64,
    pub stderr_dropped_bytes: u64,
}
