//! Directory walker used to discover backup files.
//!
//! Backed by ripgrep's `ignore` crate and `globset`. Backups are frequently
//! listed in `.gitignore` (`*.bak`), so ignore files are *not* honoured by
//! default; only the extra globs prune the walk.

use std::path::{Path, PathBuf};

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::{DirEntry, WalkBuilder};
use tracing::debug;

/// Walker with extra ignore globs.
/// Extra globs are applied in two places:
///   1) Early: prune directories during traversal (filter_entry).
///   2) Late: filter out files that still slipped through.
pub struct FileWalker
{
    /// Compiled set of additional ignore patterns
    ignore_patterns: GlobSet,

    /// Honour .gitignore/.ignore/global excludes; default false
    respect_ignore_files: bool,

    /// Follow symbolic links; default false
    follow_symlinks: bool,
}

impl FileWalker
{
    /// Build a walker with additional ignore patterns (e.g. "**/.git",
    /// "**/node_modules"). Patterns match on both absolute and relative paths.
    pub fn new(additional_ignores: &[String]) -> Result<Self>
    {
        let mut builder = GlobSetBuilder::new();

        for pattern in additional_ignores
        {
            builder.add(Glob::new(pattern)?);
        }

        Ok(Self {
            ignore_patterns: builder.build()?,
            respect_ignore_files: false,
            follow_symlinks: false,
        })
    }

    /// (Optional) Honour .gitignore and friends.
    pub fn with_ignore_files(
        mut self,
        respect: bool,
    ) -> Self
    {
        self.respect_ignore_files = respect;
        self
    }

    /// (Optional) Follow or skip symbolic links (default false).
    pub fn with_follow_symlinks(
        mut self,
        follow: bool,
    ) -> Self
    {
        self.follow_symlinks = follow;
        self
    }

    /// Internal: construct a configured WalkBuilder for `root`.
    fn build_walk(
        &self,
        root: &Path,
    ) -> WalkBuilder
    {
        let mut b = WalkBuilder::new(root);

        // Start from a clean slate, then opt back in
        b.standard_filters(false);
        b.hidden(false);

        if self.respect_ignore_files
        {
            b.ignore(true);
            b.git_ignore(true);
            b.git_global(true);
            b.git_exclude(true);
            b.require_git(false);
        }

        b.follow_links(self.follow_symlinks);

        // Early directory pruning using extra ignores (fast short-circuit).
        let extra = self
            .ignore_patterns
            .clone();
        b.filter_entry(move |ent: &DirEntry| {
            let is_dir = ent
                .file_type()
                .map(|ft| ft.is_dir())
                .unwrap_or(false);

            !(is_dir && extra.is_match(ent.path()))
        });

        b
    }

    /// Traverse regular files under `root`.
    /// Returns a **sorted** list of file paths for determinism.
    pub fn walk_files<P: AsRef<Path>>(
        &self,
        root: P,
    ) -> Vec<PathBuf>
    {
        let root_path = root.as_ref();
        let walker = self
            .build_walk(root_path)
            .build();

        let mut out: Vec<PathBuf> = walker
            .filter_map(|res| match res
            {
                Ok(entry) => Some(entry),
                Err(err) =>
                {
                    debug!(error = %err, "skipping unreadable entry");
                    None
                }
            })
            .filter(|entry| {
                entry
                    .file_type()
                    .is_some_and(|ft| ft.is_file())
            })
            .map(|entry| entry.into_path())
            // Late file-level extra ignore filtering using RELATIVE path
            .filter(|abs| {
                let rel = abs
                    .strip_prefix(root_path)
                    .unwrap_or(abs);
                !self
                    .ignore_patterns
                    .is_match(rel)
            })
            .collect();

        out.sort();

        out
    }

    /// Files whose name ends with `suffix`.
    pub fn walk_suffix<P: AsRef<Path>>(
        &self,
        root: P,
        suffix: &str,
    ) -> Vec<PathBuf>
    {
        self.walk_files(root)
            .into_iter()
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(suffix) && n.len() > suffix.len())
            })
            .collect()
    }
}
