//! Facade over the engines that also keeps the advisory state up to date.
//!
//! Correctness never depends on what is recorded here; every operation
//! re-derives its view from the repository on disk.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{instrument, warn};

use crate::{
    core::{
        apply_engine::{ApplyEngine, ApplyOptions, ApplyReport, CancellationToken, ProgressFn},
        backup::{BackupScan, BackupStore, CleanupOutcome},
        diff::{DiffReport, generate_diff_report},
        errors::EngineError,
        generator::EditGenerator,
        instruction::EditInstruction,
        rollback::{RollbackEngine, RollbackReport},
        state::{PhaseRecord, StateTracker},
    },
    infra::config::Config,
};

pub const PHASE_APPLY: &str = "apply";
pub const PHASE_APPLY_DRY_RUN: &str = "apply_dry_run";
pub const PHASE_DIFF: &str = "diff";
pub const PHASE_ROLLBACK: &str = "rollback";
pub const PHASE_REPO: &str = "repo";

pub struct Workflow {
    config: Config,
    state: StateTracker,
}

impl Workflow {
    pub fn new(config: Config) -> Self {
        let state = StateTracker::new(config.state_dir_path());
        Self { config, state }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &StateTracker {
        &self.state
    }

    pub fn backup_store(&self) -> BackupStore {
        BackupStore::new(self.config.backup_suffix.clone())
            .with_scan_ignores(self.config.scan.ignore.clone())
    }

    /// Resolve and check a repository root; batch-level failure if absent.
    pub fn resolve_repo(&self, repo_root: &Path) -> Result<PathBuf, EngineError> {
        let root = dunce::canonicalize(repo_root).map_err(|e| {
            EngineError::Configuration(format!("repository root {}: {e}", repo_root.display()))
        })?;
        if !root.is_dir() {
            return Err(EngineError::Configuration(format!(
                "repository root is not a directory: {}",
                root.display()
            )));
        }
        Ok(root)
    }

    /// Persist a phase outcome; failures are logged and swallowed.
    fn record<T: Serialize + ?Sized>(&self, phase: &str, summary: Value, report: Option<&T>) {
        if let Some(report) = report
            && let Err(e) = self.state.save_report(phase, report)
        {
            warn!(phase, error = %e, "could not persist report");
        }
        if let Err(e) = self.state.save_state(phase, summary) {
            warn!(phase, error = %e, "could not persist state");
        }
    }

    fn record_repo(&self, root: &Path) {
        self.record::<Value>(PHASE_REPO, json!({ "path": root }), None);
    }

    #[instrument(skip_all, fields(repo = %repo_root.display(), n = instructions.len()))]
    pub fn apply(
        &self,
        repo_root: &Path,
        instructions: &[EditInstruction],
        generator: Arc<dyn EditGenerator>,
        options: ApplyOptions,
        cancel: &CancellationToken,
        progress: Option<Arc<ProgressFn>>,
    ) -> Result<ApplyReport, EngineError> {
        let root = self.resolve_repo(repo_root)?;
        let mut engine = ApplyEngine::new(&root, generator, self.backup_store(), options);
        if let Some(progress) = progress {
            engine = engine.with_progress(progress);
        }
        let report = engine.apply(instructions, cancel)?;

        let phase = if report.dry_run { PHASE_APPLY_DRY_RUN } else { PHASE_APPLY };
        let s = &report.summary;
        self.record(
            phase,
            json!({
                "run_id": report.run_id,
                "total": s.total,
                "applied": s.applied,
                "skipped": s.skipped(),
                "failed": s.failed,
                "unprocessed": s.unprocessed,
                "cancelled": report.cancelled,
            }),
            Some(&report),
        );
        self.record_repo(&root);
        Ok(report)
    }

    pub fn diff(&self, repo_root: &Path, context: Option<usize>) -> Result<DiffReport, EngineError> {
        let root = self.resolve_repo(repo_root)?;
        let context = context.unwrap_or(self.config.diff_context_lines);
        let report = generate_diff_report(&self.backup_store(), &root, context)?;
        self.record(
            PHASE_DIFF,
            json!({
                "files": report.total_files,
                "files_changed": report.files_changed,
                "added": report.total_added,
                "removed": report.total_removed,
            }),
            Some(&report),
        );
        self.record_repo(&root);
        Ok(report)
    }

    /// Backups a rollback would restore, without touching anything.
    pub fn rollback_preview(&self, repo_root: &Path) -> Result<BackupScan, EngineError> {
        let root = self.resolve_repo(repo_root)?;
        self.backup_store().find_backups(&root)
    }

    pub fn rollback(&self, repo_root: &Path, delete_backups: bool) -> Result<RollbackReport, EngineError> {
        let root = self.resolve_repo(repo_root)?;
        let report = RollbackEngine::new(self.backup_store()).restore_all(&root, delete_backups)?;
        self.record(
            PHASE_ROLLBACK,
            json!({
                "restored": report.restored_count(),
                "deleted_backups": report.deleted_backups,
                "failed": report.failures.len(),
            }),
            Some(&report),
        );
        // The repository no longer reflects the last apply run
        if report.restored_count() > 0
            && let Err(e) = self.state.clear_state(PHASE_APPLY)
        {
            warn!(error = %e, "could not clear apply state");
        }
        self.record_repo(&root);
        Ok(report)
    }

    /// Remove every backup without restoring.
    pub fn cleanup(&self, repo_root: &Path) -> Result<CleanupOutcome, EngineError> {
        let root = self.resolve_repo(repo_root)?;
        self.backup_store().cleanup_backups(&root)
    }

    pub fn status(&self) -> Result<BTreeMap<String, PhaseRecord>, EngineError> {
        self.state.workflow_status()
    }
}
