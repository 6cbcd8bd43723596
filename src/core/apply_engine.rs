//! Apply engine: idempotency check -> generation -> backup -> write
//!
//! Every instruction produces exactly one `ApplyResult`; per-file failures are
//! recorded and never abort the batch. Only batch-level problems (bad repo
//! root, worker pool) come back as `Err`.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    core::{
        backup::BackupStore,
        diff::{count_changes, generate_unified_diff},
        errors::EngineError,
        generator::{EditGenerator, Generation, generate_with_timeout},
        idempotency::IdempotencyGate,
        instruction::{EditInstruction, normalize_repo_rel},
    },
    infra::io::{read_text, write_atomic},
};

/// Runtime switches for one apply run
#[derive(Debug, Clone)]
pub struct ApplyOptions
{
    /// Run every step except backup and write
    pub dry_run: bool,
    /// Consult the idempotency gate before generating
    pub skip_if_already_tagged: bool,
    /// 1 = sequential; >1 = distinct files in parallel
    pub workers: usize,
    /// Deadline for each generator / verifier call
    pub generator_timeout: Option<Duration>,
    /// Ask the generator to confirm marker hits
    pub verify_with_generator: bool,
    /// Context lines for preview diffs
    pub context_lines: usize,
}

impl Default for ApplyOptions
{
    fn default() -> Self
    {
        Self {
            dry_run: false,
            skip_if_already_tagged: true,
            workers: 1,
            generator_timeout: Some(Duration::from_secs(60)),
            verify_with_generator: true,
            context_lines: 3,
        }
    }
}

/// Outcome classification for one instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus
{
    Applied,
    SkippedAlreadyPresent,
    SkippedNoChange,
    Failed,
}

/// Where a failed instruction broke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind
{
    Validation,
    FileOperation,
    Generation,
    Backup,
    Write,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyResult
{
    /// Position in the submitted batch
    pub index: usize,
    pub file_path: PathBuf,
    pub instruction: String,
    pub rationale: String,
    pub status: ApplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub backup_created: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_checksum: Option<String>,
    pub lines_added: usize,
    pub lines_removed: usize,
    pub dry_run: bool,
    /// What would have been written (dry-run only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_diff: Option<String>,
}

impl ApplyResult
{
    fn pending(
        index: usize,
        ins: &EditInstruction,
        dry_run: bool,
    ) -> Self
    {
        Self {
            index,
            file_path: ins.file_path.clone(),
            instruction: ins.kind.name().to_string(),
            rationale: ins.rationale.clone(),
            status: ApplyStatus::Failed,
            reason: None,
            failure: None,
            error: None,
            backup_created: false,
            backup_path: None,
            backup_checksum: None,
            lines_added: 0,
            lines_removed: 0,
            dry_run,
            preview_diff: None,
        }
    }

    fn fail(
        mut self,
        kind: FailureKind,
        err: impl std::fmt::Display,
    ) -> Self
    {
        self.status = ApplyStatus::Failed;
        self.failure = Some(kind);
        self.error = Some(err.to_string());
        self
    }

    fn skip(
        mut self,
        status: ApplyStatus,
        reason: impl Into<String>,
    ) -> Self
    {
        self.status = status;
        self.reason = Some(reason.into());
        self
    }

    pub fn applied(&self) -> bool
    {
        self.status == ApplyStatus::Applied
    }

    pub fn skipped(&self) -> bool
    {
        matches!(
            self.status,
            ApplyStatus::SkippedAlreadyPresent | ApplyStatus::SkippedNoChange
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary
{
    pub total: usize,
    pub applied: usize,
    pub skipped_already_present: usize,
    pub skipped_no_change: usize,
    pub failed: usize,
    /// Instructions never reached because the run was cancelled
    pub unprocessed: usize,
    pub backups_created: usize,
    pub lines_added: usize,
    pub lines_removed: usize,
}

impl ApplySummary
{
    pub fn skipped(&self) -> usize
    {
        self.skipped_already_present + self.skipped_no_change
    }

    fn from_results(
        total: usize,
        results: &[ApplyResult],
    ) -> Self
    {
        let mut s = ApplySummary {
            total,
            unprocessed: total.saturating_sub(results.len()),
            ..Default::default()
        };
        for r in results
        {
            match r.status
            {
                ApplyStatus::Applied => s.applied += 1,
                ApplyStatus::SkippedAlreadyPresent => s.skipped_already_present += 1,
                ApplyStatus::SkippedNoChange => s.skipped_no_change += 1,
                ApplyStatus::Failed => s.failed += 1,
            }
            if r.backup_created
            {
                s.backups_created += 1;
            }
            s.lines_added += r.lines_added;
            s.lines_removed += r.lines_removed;
        }
        s
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport
{
    pub run_id: String,
    pub repo_root: PathBuf,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub results: Vec<ApplyResult>,
    pub summary: ApplySummary,
}

/// Cooperative cancellation flag, checked between instructions
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub fn cancel(&self)
    {
        self.0
            .store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool
    {
        self.0
            .load(Ordering::SeqCst)
    }
}

/// Called after every finished instruction
pub type ProgressFn = dyn Fn(&ApplyResult) + Send + Sync;

pub struct ApplyEngine
{
    repo_root: PathBuf,
    generator: Arc<dyn EditGenerator>,
    store: BackupStore,
    gate: IdempotencyGate,
    options: ApplyOptions,
    progress: Option<Arc<ProgressFn>>,
}

impl ApplyEngine
{
    pub fn new(
        repo_root: impl Into<PathBuf>,
        generator: Arc<dyn EditGenerator>,
        store: BackupStore,
        options: ApplyOptions,
    ) -> Self
    {
        let gate = if options.verify_with_generator
        {
            IdempotencyGate::with_verifier(Arc::clone(&generator), options.generator_timeout)
        }
        else
        {
            IdempotencyGate::markers_only()
        };

        Self {
            repo_root: repo_root.into(),
            generator,
            store,
            gate,
            options,
            progress: None,
        }
    }

    pub fn with_progress(
        mut self,
        progress: Arc<ProgressFn>,
    ) -> Self
    {
        self.progress = Some(progress);
        self
    }

    pub fn options(&self) -> &ApplyOptions
    {
        &self.options
    }

    pub fn store(&self) -> &BackupStore
    {
        &self.store
    }

    /// Run `instructions` in submission order and report every outcome.
    #[instrument(skip_all, fields(repo = %self.repo_root.display(), n = instructions.len(), dry_run = self.options.dry_run))]
    pub fn apply(
        &self,
        instructions: &[EditInstruction],
        cancel: &CancellationToken,
    ) -> Result<ApplyReport, EngineError>
    {
        if !self
            .repo_root
            .is_dir()
        {
            return Err(EngineError::Configuration(format!(
                "repository root is not a directory: {}",
                self.repo_root
                    .display()
            )));
        }

        self.store
            .begin_run();
        let started_at = Utc::now();
        let run_id = generate_run_id();
        info!(run_id = %run_id, "apply run started");

        let indexed: Vec<(usize, &EditInstruction)> = instructions
            .iter()
            .enumerate()
            .collect();

        let results = if self
            .options
            .workers
            <= 1
        {
            self.run_group(&indexed, cancel)
        }
        else
        {
            self.run_parallel(&indexed, cancel)?
        };

        let summary = ApplySummary::from_results(instructions.len(), &results);
        let cancelled = cancel.is_cancelled() && summary.unprocessed > 0;
        if cancelled
        {
            warn!(unprocessed = summary.unprocessed, "apply run cancelled");
        }
        info!(
            applied = summary.applied,
            skipped = summary.skipped(),
            failed = summary.failed,
            "apply run finished"
        );

        Ok(ApplyReport {
            run_id,
            repo_root: self
                .repo_root
                .clone(),
            dry_run: self
                .options
                .dry_run,
            started_at,
            finished_at: Utc::now(),
            cancelled,
            results,
            summary,
        })
    }

    /// Distinct files in parallel; one worker owns every instruction of a file.
    fn run_parallel(
        &self,
        indexed: &[(usize, &EditInstruction)],
        cancel: &CancellationToken,
    ) -> Result<Vec<ApplyResult>, EngineError>
    {
        let mut groups: IndexMap<PathBuf, Vec<(usize, &EditInstruction)>> = IndexMap::new();
        for (idx, ins) in indexed
        {
            let key = normalize_repo_rel(&ins.file_path).unwrap_or_else(|_| {
                ins.file_path
                    .clone()
            });
            groups
                .entry(key)
                .or_default()
                .push((*idx, *ins));
        }
        let groups: Vec<Vec<(usize, &EditInstruction)>> = groups
            .into_values()
            .collect();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(
                self.options
                    .workers,
            )
            .build()
            .map_err(|e| EngineError::Configuration(format!("worker pool: {e}")))?;

        debug!(groups = groups.len(), workers = self.options.workers, "parallel apply");
        let mut results: Vec<ApplyResult> = pool.install(|| {
            groups
                .par_iter()
                .flat_map_iter(|group| self.run_group(group, cancel))
                .collect()
        });
        results.sort_by_key(|r| r.index);
        Ok(results)
    }

    /// Process a run of instructions in order, sharing one dry-run overlay.
    fn run_group(
        &self,
        items: &[(usize, &EditInstruction)],
        cancel: &CancellationToken,
    ) -> Vec<ApplyResult>
    {
        let mut overlay: HashMap<PathBuf, String> = HashMap::new();
        let mut out = Vec::with_capacity(items.len());
        for (idx, ins) in items
        {
            if cancel.is_cancelled()
            {
                break;
            }
            let result = self.apply_one(*idx, ins, &mut overlay);
            if let Some(progress) = &self.progress
            {
                progress(&result);
            }
            out.push(result);
        }
        out
    }

    fn apply_one(
        &self,
        index: usize,
        ins: &EditInstruction,
        overlay: &mut HashMap<PathBuf, String>,
    ) -> ApplyResult
    {
        let dry_run = self
            .options
            .dry_run;
        let result = ApplyResult::pending(index, ins, dry_run);

        if let Err(e) = ins.validate(
            self.store
                .suffix(),
        )
        {
            return result.fail(FailureKind::Validation, e);
        }
        let target = match normalize_repo_rel(&ins.file_path)
        {
            Ok(rel) => self
                .repo_root
                .join(rel),
            Err(e) => return result.fail(FailureKind::Validation, e),
        };
        if target.exists() && !is_within(&self.repo_root, &target)
        {
            return result.fail(
                FailureKind::Validation,
                EngineError::Validation(format!(
                    "{} resolves outside the repository",
                    ins.file_path
                        .display()
                )),
            );
        }

        // 1. current content (dry-run sees its own earlier effects)
        let content = match overlay.get(&target)
        {
            Some(staged) => staged.clone(),
            None => match read_text(&target)
            {
                Ok(s) => s,
                Err(e) => return result.fail(FailureKind::FileOperation, e),
            },
        };

        // 2. already applied?
        if self
            .options
            .skip_if_already_tagged
        {
            let decision = self
                .gate
                .should_skip(&content, ins);
            if decision.skip
            {
                debug!(path = %target.display(), reason = %decision.reason, "skipping");
                return result.skip(ApplyStatus::SkippedAlreadyPresent, decision.reason);
            }
        }

        // 3. generate
        let generated = match generate_with_timeout(
            &self.generator,
            &content,
            ins,
            self.options
                .generator_timeout,
        )
        {
            Ok(g) => g,
            Err(e) =>
            {
                warn!(path = %target.display(), error = %e, "generation failed");
                return result.fail(FailureKind::Generation, EngineError::from(e));
            }
        };
        let (new_content, gen_reason) = match generated
        {
            Generation::NoChange { reason } =>
            {
                return result.skip(ApplyStatus::SkippedNoChange, reason);
            }
            Generation::Updated { content: new, reason } => (new, reason),
        };
        if new_content == content
        {
            return result.skip(
                ApplyStatus::SkippedNoChange,
                "generator returned identical content",
            );
        }

        let diff = generate_unified_diff(
            &content,
            &new_content,
            self.options
                .context_lines,
        );
        if diff.is_empty()
        {
            // only line endings differ
            return result.skip(
                ApplyStatus::SkippedNoChange,
                "generator output differs only in line endings",
            );
        }
        let (added, removed) = count_changes(&diff);
        let mut result = result;
        result.lines_added = added;
        result.lines_removed = removed;
        result.reason = gen_reason;

        // 4. backup then write (or stage only, in dry-run)
        if dry_run
        {
            overlay.insert(target, new_content);
            result.status = ApplyStatus::Applied;
            result.preview_diff = Some(diff);
            return result;
        }

        let backup = match self
            .store
            .create_backup(&target)
        {
            Ok(b) => b,
            Err(e) =>
            {
                warn!(path = %target.display(), error = %e, "backup failed; not writing");
                return result.fail(FailureKind::Backup, e);
            }
        };
        result.backup_created = backup.created;
        result.backup_path = Some(backup.path);
        result.backup_checksum = Some(backup.checksum);

        if let Err(e) = write_atomic(&target, new_content.as_bytes())
        {
            warn!(path = %target.display(), error = %e, "write failed; backup retained");
            return result.fail(FailureKind::Write, e);
        }

        info!(path = %target.display(), added, removed, "applied");
        result.status = ApplyStatus::Applied;
        result
    }
}

/// Sortable, filesystem-safe run ID: `apply_<UTC ts>_<random>`.
fn generate_run_id() -> String
{
    let ts = Utc::now()
        .format("%Y%m%dT%H%M%SZ")
        .to_string();
    let alphabet = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    let suffix: String = (0..8)
        .map(|_| {
            let idx = rng.random_range(0..alphabet.len());
            alphabet[idx] as char
        })
        .collect();
    format!("apply_{ts}_{suffix}")
}

/// True if `path` is inside `root` after resolving symlinks in both.
fn is_within(
    root: &Path,
    path: &Path,
) -> bool
{
    let root = dunce::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    let path = dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    path.starts_with(root)
}

#[cfg(test)]
mod tests
{
    use std::{collections::BTreeMap, fs};

    use tempfile::TempDir;

    use super::*;
    use crate::core::{
        generator::GenerationError,
        instruction::{InstructionKind, TrackAction},
    };

    /// Appends `// <event>` to the content
    struct Append;

    impl EditGenerator for Append
    {
        fn generate(
            &self,
            content: &str,
            ins: &EditInstruction,
        ) -> Result<Generation, GenerationError>
        {
            let InstructionKind::TrackEvent { event, .. } = &ins.kind
            else
            {
                return Ok(Generation::NoChange {
                    reason: "unsupported".into(),
                });
            };
            Ok(Generation::Updated {
                content: format!("{content}// {event}\n"),
                reason: Some(format!("added {event}")),
            })
        }
    }

    fn track(
        file: &str,
        event: &str,
    ) -> EditInstruction
    {
        EditInstruction::new(
            file,
            "test",
            InstructionKind::TrackEvent {
                event: event.into(),
                action: TrackAction::Click,
                params: BTreeMap::new(),
            },
        )
    }

    fn engine(
        root: &Path,
        options: ApplyOptions,
    ) -> ApplyEngine
    {
        ApplyEngine::new(
            root,
            Arc::new(Append),
            BackupStore::new(".taggingai.bak"),
            options,
        )
    }

    #[test]
    fn validation_failures_touch_nothing()
    {
        let tmp = TempDir::new().unwrap();
        let eng = engine(tmp.path(), ApplyOptions::default());
        let report = eng
            .apply(&[track("../escape.js", "trackClick")], &CancellationToken::new())
            .unwrap();
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.results[0].failure, Some(FailureKind::Validation));
    }

    #[test]
    fn missing_file_is_isolated()
    {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("b.js"), "b\n").unwrap();
        let eng = engine(tmp.path(), ApplyOptions::default());
        let report = eng
            .apply(
                &[track("missing.js", "trackClick"), track("b.js", "trackClick")],
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(report.results[0].failure, Some(FailureKind::FileOperation));
        assert!(report.results[1].applied());
        assert_eq!(report.results[1].lines_added, 1);
    }

    #[test]
    fn missing_repo_root_is_batch_error()
    {
        let tmp = TempDir::new().unwrap();
        let eng = engine(&tmp.path().join("nope"), ApplyOptions::default());
        let err = eng
            .apply(&[], &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn dry_run_overlay_sees_earlier_edits()
    {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.js"), "a\n").unwrap();
        let eng = engine(
            tmp.path(),
            ApplyOptions {
                dry_run: true,
                ..Default::default()
            },
        );
        let report = eng
            .apply(
                &[track("a.js", "trackOne"), track("a.js", "trackOne")],
                &CancellationToken::new(),
            )
            .unwrap();
        assert!(report.results[0].applied());
        assert!(
            report.results[0]
                .preview_diff
                .as_deref()
                .unwrap()
                .contains("+// trackOne")
        );
        assert_eq!(report.results[1].status, ApplyStatus::SkippedAlreadyPresent);
        assert_eq!(fs::read_to_string(tmp.path().join("a.js")).unwrap(), "a\n");
        assert!(!tmp.path().join("a.js.taggingai.bak").exists());
    }

    /// Rewrites CRLF line endings to LF and nothing else
    struct StripCr;

    impl EditGenerator for StripCr
    {
        fn generate(
            &self,
            content: &str,
            _: &EditInstruction,
        ) -> Result<Generation, GenerationError>
        {
            Ok(Generation::Updated {
                content: content.replace("\r\n", "\n"),
                reason: None,
            })
        }
    }

    #[test]
    fn line_ending_only_output_is_no_change()
    {
        let tmp = TempDir::new().unwrap();
        let original = "a\r\nb\r\n";
        fs::write(tmp.path().join("a.js"), original).unwrap();
        let eng = ApplyEngine::new(
            tmp.path(),
            Arc::new(StripCr),
            BackupStore::new(".taggingai.bak"),
            ApplyOptions::default(),
        );
        let report = eng
            .apply(&[track("a.js", "trackClick")], &CancellationToken::new())
            .unwrap();
        let r = &report.results[0];
        assert_eq!(r.status, ApplyStatus::SkippedNoChange);
        assert_eq!(r.lines_added, 0);
        assert!(r.reason.as_deref().unwrap().contains("line endings"));
        assert_eq!(report.summary.applied, 0);
        assert_eq!(fs::read_to_string(tmp.path().join("a.js")).unwrap(), original);
        assert!(!tmp.path().join("a.js.taggingai.bak").exists());
    }

    #[test]
    fn pre_cancelled_run_processes_nothing()
    {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.js"), "a\n").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = engine(tmp.path(), ApplyOptions::default())
            .apply(&[track("a.js", "trackClick")], &cancel)
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.summary.unprocessed, 1);
        assert!(report.results.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_repo_is_rejected()
    {
        let outside = TempDir::new().unwrap();
        let secret = outside
            .path()
            .join("secret.js");
        fs::write(&secret, "s\n").unwrap();

        let repo = TempDir::new().unwrap();
        std::os::unix::fs::symlink(&secret, repo.path().join("link.js")).unwrap();

        let report = engine(repo.path(), ApplyOptions::default())
            .apply(&[track("link.js", "trackClick")], &CancellationToken::new())
            .unwrap();
        assert_eq!(report.results[0].failure, Some(FailureKind::Validation));
        assert_eq!(fs::read_to_string(&secret).unwrap(), "s\n");
    }

    #[test]
    fn run_id_shape()
    {
        let id = generate_run_id();
        assert!(id.starts_with("apply_"));
        assert_eq!(id.split('_').count(), 3);
    }
}
