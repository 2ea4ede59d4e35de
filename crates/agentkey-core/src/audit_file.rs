//! File mirror for the audit ledger.
//!
//! Appends one JSON object per committed [`AuditRecord`] to a file, for
//! shipping to log pipelines. The file is opened in append-only mode; no
//! update or delete operations are ever performed.
//!
//! # Thread safety
//!
//! Uses a `tokio::sync::Mutex` around the file handle to serialize writes.
//! The critical section is one `write_all` plus a flush.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::audit::{AuditRecord, AuditSink};
use crate::error::AuditError;

const SINK_NAME: &str = "file";

/// Audit sink that writes JSON lines to a file.
pub struct FileAuditSink {
    path: PathBuf,
    writer: Mutex<Option<tokio::fs::File>>,
}

impl FileAuditSink {
    /// Create a sink writing to `path`.
    ///
    /// The file is created (or opened for append) lazily on the first write.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: Mutex::new(None),
        }
    }

    fn failure(reason: String) -> AuditError {
        AuditError::Sink {
            name: SINK_NAME.to_owned(),
            reason,
        }
    }
}

#[async_trait::async_trait]
impl AuditSink for FileAuditSink {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        SINK_NAME
    }

    async fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(record).map_err(|e| AuditError::Serialization {
            reason: e.to_string(),
        })?;
        line.push(b'\n');

        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| {
                    Self::failure(format!(
                        "failed to open audit file '{}': {e}",
                        self.path.display()
                    ))
                })?;
            *guard = Some(file);
        }
        let file = guard
            .as_mut()
            .ok_or_else(|| Self::failure("file handle missing after open".to_owned()))?;

        file.write_all(&line)
            .await
            .map_err(|e| Self::failure(format!("write failed: {e}")))?;
        file.flush()
            .await
            .map_err(|e| Self::failure(format!("flush failed: {e}")))?;
        Ok(())
    }
}

impl std::fmt::Debug for FileAuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAuditSink")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use agentkey_storage::MemoryBackend;
    use chrono::Utc;

    use super::*;
    use crate::audit::{
        AuditAction, AuditActor, AuditLedger, AuditSubject, NewAuditRecord, StoreLedger,
        SubjectKind,
    };
    use crate::ids::TenantId;
    use crate::records::{RecordStore, Transaction};

    #[tokio::test]
    async fn committed_records_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let sink: Arc<dyn AuditSink> = Arc::new(FileAuditSink::new(&path));
        let ledger = StoreLedger::open(RecordStore::new(Arc::new(MemoryBackend::new())), vec![sink])
            .await
            .unwrap();
        let tenant = TenantId::new();

        for action in [AuditAction::SecretDeposit, AuditAction::SecretRevoke] {
            ledger
                .record(
                    Transaction::new(),
                    NewAuditRecord::succeeded(
                        tenant,
                        AuditActor::System,
                        action,
                        AuditSubject::new(SubjectKind::Secret, "s-1"),
                        Utc::now(),
                    ),
                )
                .await
                .unwrap();
        }

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<AuditRecord> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].action, AuditAction::SecretDeposit);
        assert_eq!(lines[1].action, AuditAction::SecretRevoke);
    }

    #[tokio::test]
    async fn unwritable_path_reports_sink_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileAuditSink::new(dir.path().join("missing").join("audit.log"));
        let record = AuditRecord {
            id: uuid::Uuid::new_v4(),
            sequence: 1,
            tenant: TenantId::new(),
            actor: AuditActor::System,
            action: AuditAction::TenantBootstrap,
            outcome: crate::audit::AuditOutcome::Succeeded,
            subject: AuditSubject::new(SubjectKind::Tenant, "t"),
            metadata: serde_json::Value::Null,
            timestamp: Utc::now(),
        };
        assert!(matches!(
            sink.write(&record).await,
            Err(AuditError::Sink { .. })
        ));
    }
}
