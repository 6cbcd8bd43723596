//! Shared test utilities for integration tests
//!
//! Deterministic generator stubs and small fixture helpers.

#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use assert_fs::prelude::*;
use tagsafe::core::{
    apply_engine::{ApplyEngine, ApplyOptions, CancellationToken},
    backup::BackupStore,
    generator::{EditGenerator, Generation, GenerationError},
    instruction::{EditInstruction, InstructionKind, TrackAction},
};

pub const SUFFIX: &str = ".taggingai.bak";

/// Appends `// <event>` so the event name doubles as the marker.
#[derive(Default)]
pub struct MarkerGen
{
    pub calls: AtomicUsize,
}

impl EditGenerator for MarkerGen
{
    fn generate(
        &self,
        content: &str,
        ins: &EditInstruction,
    ) -> Result<Generation, GenerationError>
    {
        self.calls
            .fetch_add(1, Ordering::SeqCst);
        match &ins.kind
        {
            InstructionKind::TrackEvent { event, .. } => Ok(Generation::Updated {
                content: format!("{content}// {event}\n"),
                reason: Some(format!("added {event}")),
            }),
            _ => Ok(Generation::NoChange {
                reason: "nothing to add".into(),
            }),
        }
    }
}

/// `MarkerGen`, except one file always fails.
pub struct FailFor
{
    pub file: PathBuf,
    pub inner: MarkerGen,
}

impl EditGenerator for FailFor
{
    fn generate(
        &self,
        content: &str,
        ins: &EditInstruction,
    ) -> Result<Generation, GenerationError>
    {
        if ins.file_path == self.file
        {
            return Err(GenerationError::Malformed("model returned prose".into()));
        }
        self.inner
            .generate(content, ins)
    }
}

/// Sleeps before answering like `MarkerGen`.
pub struct SlowGen(pub Duration);

impl EditGenerator for SlowGen
{
    fn generate(
        &self,
        content: &str,
        ins: &EditInstruction,
    ) -> Result<Generation, GenerationError>
    {
        thread::sleep(self.0);
        MarkerGen::default().generate(content, ins)
    }
}

pub struct PanicGen;

impl EditGenerator for PanicGen
{
    fn generate(
        &self,
        _: &str,
        _: &EditInstruction,
    ) -> Result<Generation, GenerationError>
    {
        panic!("generator bug");
    }
}

/// Cancels `token` during its first call, then behaves like `MarkerGen`.
pub struct CancelAfterFirst
{
    pub token: CancellationToken,
}

impl EditGenerator for CancelAfterFirst
{
    fn generate(
        &self,
        content: &str,
        ins: &EditInstruction,
    ) -> Result<Generation, GenerationError>
    {
        self.token
            .cancel();
        MarkerGen::default().generate(content, ins)
    }
}

pub fn track(
    file: &str,
    event: &str,
) -> EditInstruction
{
    EditInstruction::new(
        file,
        "user clicks the button",
        InstructionKind::TrackEvent {
            event: event.into(),
            action: TrackAction::Click,
            params: BTreeMap::new(),
        },
    )
}

/// Temp repo populated with `(relative path, content)` pairs.
pub fn repo(files: &[(&str, &str)]) -> assert_fs::TempDir
{
    let tmp = assert_fs::TempDir::new().expect("tempdir");
    for (rel, body) in files
    {
        tmp.child(rel)
            .write_str(body)
            .expect("write fixture");
    }
    tmp
}

pub fn engine(
    root: &Path,
    generator: Arc<dyn EditGenerator>,
    options: ApplyOptions,
) -> ApplyEngine
{
    ApplyEngine::new(root, generator, BackupStore::new(SUFFIX), options)
}

/// Default options minus the verifier round-trip.
pub fn opts() -> ApplyOptions
{
    ApplyOptions {
        verify_with_generator: false,
        ..Default::default()
    }
}

pub fn read(
    root: &Path,
    rel: &str,
) -> String
{
    fs::read_to_string(root.join(rel)).expect("read fixture file")
}

pub fn backup_of(
    root: &Path,
    rel: &str,
) -> PathBuf
{
    root.join(format!("{rel}{SUFFIX}"))
}

/// Every backup file under `root`, relative and sorted.
pub fn backups_under(root: &Path) -> Vec<PathBuf>
{
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop()
    {
        for entry in fs::read_dir(&dir).expect("read_dir")
        {
            let path = entry
                .expect("entry")
                .path();
            if path.is_dir()
            {
                stack.push(path);
            }
            else if path
                .to_string_lossy()
                .ends_with(SUFFIX)
            {
                out.push(
                    path.strip_prefix(root)
                        .expect("under root")
                        .to_path_buf(),
                );
            }
        }
    }
    out.sort();
    out
}
