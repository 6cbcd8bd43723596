//! Repository-wide restore from side-by-side backups.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::{backup::BackupStore, errors::EngineError};

/// A file that could not be restored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackFailure {
    pub path: PathBuf,
    pub backup_path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackReport {
    pub repo_root: PathBuf,
    pub finished_at: DateTime<Utc>,
    /// Repo-relative paths restored, in scan order
    pub restored: Vec<PathBuf>,
    /// Restored files whose original had been deleted
    pub recreated: Vec<PathBuf>,
    pub deleted_backups: usize,
    pub failures: Vec<RollbackFailure>,
}

impl RollbackReport {
    pub fn restored_count(&self) -> usize {
        self.restored.len()
    }

    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct RollbackEngine {
    store: BackupStore,
}

impl RollbackEngine {
    pub fn new(store: BackupStore) -> Self {
        Self { store }
    }

    /// Restore every backup under `root`. Individual failures are collected;
    /// with no backups left this is a no-op reporting zero of everything.
    #[instrument(skip(self), fields(root = %root.display()))]
    pub fn restore_all(&self, root: &Path, delete_backups: bool) -> Result<RollbackReport, EngineError> {
        let scan = self.store.find_backups(root)?;
        let mut report = RollbackReport {
            repo_root: root.to_path_buf(),
            finished_at: Utc::now(),
            restored: Vec::new(),
            recreated: Vec::new(),
            deleted_backups: 0,
            failures: Vec::new(),
        };

        for (i, pair) in scan.all().enumerate() {
            let rel = pair.original.strip_prefix(root).unwrap_or(&pair.original).to_path_buf();
            match self.store.restore_from_backup(&pair.backup, &pair.original, delete_backups) {
                Ok(()) => {
                    if i >= scan.pairs.len() {
                        report.recreated.push(rel.clone());
                    }
                    report.restored.push(rel);
                    if delete_backups {
                        report.deleted_backups += 1;
                    }
                }
                Err(e) => {
                    warn!(path = %pair.original.display(), error = %e, "restore failed");
                    report.failures.push(RollbackFailure {
                        path: rel,
                        backup_path: pair.backup.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        report.finished_at = Utc::now();
        info!(
            restored = report.restored.len(),
            recreated = report.recreated.len(),
            failed = report.failures.len(),
            "rollback finished"
        );
        Ok(report)
    }
}
