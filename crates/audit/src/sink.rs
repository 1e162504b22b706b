use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use parking_lot::Mutex;
use thiserror::Error;

use crate::record::AuditRecord;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Destination for audit records. Implementations must tolerate being
/// called from concurrent requests.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Append-only JSON Lines file, one record per line, synced per write
/// so records survive an abrupt death of the server itself.
pub struct JsonlAuditSink {
    file: Mutex<File>,
}

impl JsonlAuditSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Mutex::new(file) })
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let line = serde_json::to_string(record)?;
        let mut file = self.file.lock();
        writeln!(file, "{line}")?;
        file.sync_all()?;
        Ok(())
    }
}
