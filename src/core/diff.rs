//! Unified diffs between backups and live files.
//!
//! Reports are a projection over the filesystem: they are rebuilt on every
//! call and never cached.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use tracing::{debug, instrument};

use crate::{
    core::{
        backup::{BackupPair, BackupStore},
        errors::EngineError,
    },
    infra::io::read_text,
};

/// Per-file diff status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffStatus {
    Modified,
    Unchanged,
    /// Backup present, original deleted; shown as a full removal
    OriginalMissing,
    /// Backup or original could not be read as text
    Unreadable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDiff {
    /// Repo-relative path of the original
    pub path: PathBuf,
    pub backup_path: PathBuf,
    pub status: DiffStatus,
    pub diff: String,
    pub added: usize,
    pub removed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffReport {
    pub repo_root: PathBuf,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<FileDiff>,
    pub total_files: usize,
    pub files_changed: usize,
    pub total_added: usize,
    pub total_removed: usize,
}

fn normalize_newlines(s: &str) -> std::borrow::Cow<'_, str> {
    if s.contains('\r') {
        std::borrow::Cow::Owned(s.replace("\r\n", "\n"))
    } else {
        std::borrow::Cow::Borrowed(s)
    }
}

/// Unified diff of `old` -> `new` with `context` lines around each hunk.
/// CRLF is folded to LF first. Identical inputs give an empty string.
pub fn generate_unified_diff(old: &str, new: &str, context: usize) -> String {
    generate_labeled_diff(old, new, context, "a", "b")
}

/// As `generate_unified_diff`, with `---`/`+++` header labels.
pub fn generate_labeled_diff(
    old: &str,
    new: &str,
    context: usize,
    old_label: &str,
    new_label: &str,
) -> String {
    let old = normalize_newlines(old);
    let new = normalize_newlines(new);
    let diff = TextDiff::from_lines(old.as_ref(), new.as_ref());
    diff.unified_diff()
        .context_radius(context)
        .header(old_label, new_label)
        .to_string()
}

/// Old/new line counts from a `@@ -a,b +c,d @@` header (missing counts are 1).
fn hunk_lengths(header: &str) -> Option<(usize, usize)> {
    let mut parts = header.strip_prefix("@@ ")?.split_whitespace();
    let span = |s: &str| -> Option<usize> {
        match s.split_once(',') {
            Some((_, len)) => len.parse().ok(),
            None => Some(1),
        }
    };
    let old = span(parts.next()?.strip_prefix('-')?)?;
    let new = span(parts.next()?.strip_prefix('+')?)?;
    Some((old, new))
}

/// `(added, removed)` line counts of one or more concatenated unified diffs.
/// Only lines inside a hunk body count, so `---`/`+++` file headers and
/// `\ No newline` hints are skipped.
pub fn count_changes(diff: &str) -> (usize, usize) {
    let mut added = 0;
    let mut removed = 0;
    // lines still expected in the current hunk: (old side, new side)
    let mut left = (0usize, 0usize);
    for line in diff.lines() {
        if left == (0, 0) {
            if line.starts_with("@@")
                && let Some(lens) = hunk_lengths(line)
            {
                left = lens;
            }
            continue;
        }
        match line.as_bytes().first() {
            Some(b'+') => {
                added += 1;
                left.1 = left.1.saturating_sub(1);
            }
            Some(b'-') => {
                removed += 1;
                left.0 = left.0.saturating_sub(1);
            }
            Some(b'\\') => {}
            _ => {
                left.0 = left.0.saturating_sub(1);
                left.1 = left.1.saturating_sub(1);
            }
        }
    }
    (added, removed)
}

fn relative(root: &Path, p: &Path) -> PathBuf {
    p.strip_prefix(root).unwrap_or(p).to_path_buf()
}

fn diff_pair(root: &Path, pair: &BackupPair, orphan: bool, context: usize) -> FileDiff {
    let rel = relative(root, &pair.original);
    let label = rel.display().to_string();
    let unreadable = |error: String| FileDiff {
        path: rel.clone(),
        backup_path: pair.backup.clone(),
        status: DiffStatus::Unreadable,
        diff: String::new(),
        added: 0,
        removed: 0,
        error: Some(error),
    };

    let before = match read_text(&pair.backup) {
        Ok(s) => s,
        Err(e) => return unreadable(e.to_string()),
    };
    let after = if orphan {
        String::new()
    } else {
        match read_text(&pair.original) {
            Ok(s) => s,
            Err(e) => return unreadable(e.to_string()),
        }
    };

    let diff = generate_labeled_diff(
        &before,
        &after,
        context,
        &format!("a/{label}"),
        &format!("b/{label}"),
    );
    let (added, removed) = count_changes(&diff);
    let status = if orphan {
        DiffStatus::OriginalMissing
    } else if diff.is_empty() {
        DiffStatus::Unchanged
    } else {
        DiffStatus::Modified
    };

    FileDiff {
        path: rel,
        backup_path: pair.backup.clone(),
        status,
        diff,
        added,
        removed,
        error: None,
    }
}

/// Diff every backup under `root` against its current original.
#[instrument(skip(store), fields(root = %root.display()))]
pub fn generate_diff_report(
    store: &BackupStore,
    root: &Path,
    context: usize,
) -> Result<DiffReport, EngineError> {
    let scan = store.find_backups(root)?;
    debug!(pairs = scan.pairs.len(), orphans = scan.orphans.len(), "diffing backups");

    let files: Vec<FileDiff> = scan
        .pairs
        .iter()
        .map(|p| diff_pair(root, p, false, context))
        .chain(scan.orphans.iter().map(|p| diff_pair(root, p, true, context)))
        .collect();

    Ok(DiffReport {
        repo_root: root.to_path_buf(),
        generated_at: Utc::now(),
        total_files: files.len(),
        files_changed: files
            .iter()
            .filter(|f| matches!(f.status, DiffStatus::Modified | DiffStatus::OriginalMissing))
            .count(),
        total_added: files.iter().map(|f| f.added).sum(),
        total_removed: files.iter().map(|f| f.removed).sum(),
        files,
    })
}
