pub mod hash;
pub mod record;
pub mod sink;

pub use hash::{hash_args, is_sensitive_key, sanitize_args, REDACTED_PLACEHOLDER};
pub use record::{AuditRecord, AuditStatus};
pub use sink::{AuditError, AuditSink, JsonlAuditSink};
