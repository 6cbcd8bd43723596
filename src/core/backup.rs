//! Side-by-side backup store.
//!
//! Every backup lives next to its original as `<name><suffix>` so it can be
//! found again by a plain directory walk. Backups are staged in a temp file
//! and atomically linked into place without clobbering: whichever snapshot
//! got there first is the pristine original and is never replaced.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::Read,
    path::{Path, PathBuf},
    sync::Mutex,
};

use blake3::Hasher as Blake3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    core::errors::EngineError,
    infra::{
        io::{write_atomic, write_new_atomic},
        walk::FileWalker,
    },
};

/// Result of `create_backup`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupOutcome {
    pub path: PathBuf,
    pub created: bool,      // false when an existing snapshot was reused
    pub checksum: String,   // blake3:<hex>
}

/// A backup file and the original it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackupPair {
    pub original: PathBuf,
    pub backup: PathBuf,
}

/// Backups found under a root, split by whether the original still exists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupScan {
    pub pairs: Vec<BackupPair>,
    pub orphans: Vec<BackupPair>, // original missing
}

impl BackupScan {
    pub fn total(&self) -> usize {
        self.pairs.len() + self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Pairs then orphans, both in path order.
    pub fn all(&self) -> impl Iterator<Item = &BackupPair> {
        self.pairs.iter().chain(self.orphans.iter())
    }
}

/// Outcome of `cleanup_backups`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupOutcome {
    pub deleted: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, String)>,
}

#[derive(Debug)]
pub struct BackupStore {
    suffix: String,
    scan_ignores: Vec<String>,
    // original -> outcome, for the current apply run
    run: Mutex<HashMap<PathBuf, BackupOutcome>>,
}

impl BackupStore {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
            scan_ignores: vec!["**/.git".to_string()],
            run: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the glob list used to prune backup scans.
    pub fn with_scan_ignores(mut self, ignores: Vec<String>) -> Self {
        self.scan_ignores = ignores;
        self
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Forget which paths were backed up; call at the start of each run.
    pub fn begin_run(&self) {
        if let Ok(mut run) = self.run.lock() {
            run.clear();
        }
    }

    /// `<dir>/<name><suffix>`
    pub fn backup_path_for(&self, original: &Path) -> PathBuf {
        let mut name = original
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(&self.suffix);
        original.with_file_name(name)
    }

    /// Inverse of `backup_path_for`; `None` if `backup` does not carry the suffix.
    pub fn original_for(&self, backup: &Path) -> Option<PathBuf> {
        let name = backup.file_name()?.to_str()?;
        let stem = name.strip_suffix(self.suffix.as_str())?;
        if stem.is_empty() {
            return None;
        }
        Some(backup.with_file_name(stem))
    }

    pub fn is_backup(&self, path: &Path) -> bool {
        self.original_for(path).is_some()
    }

    /// Snapshot `path` before its first write in this run.
    ///
    /// A second call for the same path in a run returns the recorded outcome
    /// without touching disk. A backup left by an earlier run is kept as is.
    pub fn create_backup(&self, path: &Path) -> Result<BackupOutcome, EngineError> {
        if let Some(prev) = self
            .run
            .lock()
            .map_err(|_| EngineError::backup(path, "backup registry poisoned"))?
            .get(path)
        {
            debug!(path = %path.display(), "backup already taken this run");
            return Ok(BackupOutcome {
                created: false,
                ..prev.clone()
            });
        }

        let bytes = fs::read(path).map_err(|e| EngineError::backup(path, format!("read source: {e}")))?;
        let backup = self.backup_path_for(path);

        let created = write_new_atomic(&backup, &bytes)
            .map_err(|e| EngineError::backup(path, e))?;
        if !created {
            info!(backup = %backup.display(), "keeping existing backup from an earlier run");
        }

        let outcome = BackupOutcome {
            checksum: checksum(&backup).map_err(|e| EngineError::backup(path, e))?,
            path: backup,
            created,
        };
        self.run
            .lock()
            .map_err(|_| EngineError::backup(path, "backup registry poisoned"))?
            .insert(path.to_path_buf(), outcome.clone());
        Ok(outcome)
    }

    /// All backups under `root`, sorted, with orphans listed separately.
    pub fn find_backups(&self, root: &Path) -> Result<BackupScan, EngineError> {
        if !root.is_dir() {
            return Err(EngineError::Configuration(format!(
                "repository root is not a directory: {}",
                root.display()
            )));
        }
        let walker = FileWalker::new(&self.scan_ignores)
            .map_err(|e| EngineError::Configuration(format!("bad scan ignore glob: {e}")))?;

        let mut scan = BackupScan::default();
        for backup in walker.walk_suffix(root, &self.suffix) {
            let Some(original) = self.original_for(&backup) else {
                continue;
            };
            // A backup of a backup is never produced by the engine; leave it alone
            if self.is_backup(&original) {
                warn!(path = %backup.display(), "ignoring nested backup");
                continue;
            }
            let pair = BackupPair { original, backup };
            if pair.original.exists() {
                scan.pairs.push(pair);
            } else {
                scan.orphans.push(pair);
            }
        }
        Ok(scan)
    }

    /// Copy `backup` over `target`; delete the backup only after the write landed.
    pub fn restore_from_backup(
        &self,
        backup: &Path,
        target: &Path,
        delete_backup: bool,
    ) -> Result<(), EngineError> {
        let bytes = fs::read(backup).map_err(|e| EngineError::backup(backup, format!("read backup: {e}")))?;
        write_atomic(target, &bytes)?;
        if delete_backup {
            fs::remove_file(backup).map_err(|e| EngineError::io("delete backup", backup, e))?;
        }
        if let Ok(mut run) = self.run.lock() {
            run.remove(target);
        }
        Ok(())
    }

    /// Delete every backup under `root`; failures are collected per file.
    pub fn cleanup_backups(&self, root: &Path) -> Result<CleanupOutcome, EngineError> {
        let scan = self.find_backups(root)?;
        let mut out = CleanupOutcome::default();
        for pair in scan.all() {
            match fs::remove_file(&pair.backup) {
                Ok(()) => out.deleted.push(pair.backup.clone()),
                Err(e) => out.failures.push((pair.backup.clone(), e.to_string())),
            }
        }
        if let Ok(mut run) = self.run.lock() {
            run.clear();
        }
        Ok(out)
    }
}

/// Stream a file into a blake3 digest as `blake3:<hex>`.
pub fn checksum(path: &Path) -> Result<String, EngineError> {
    let mut f = File::open(path).map_err(|e| EngineError::io("checksum", path, e))?;
    let mut hasher = Blake3::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf).map_err(|e| EngineError::io("checksum", path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("blake3:{}", hasher.finalize().to_hex()))
}
