//! Workflow facade: reports and phase state around apply/diff/rollback.

mod util;

use std::{fs, sync::Arc};

use serde_json::Value;
use tagsafe::{
    Config,
    core::{
        apply_engine::{ApplyReport, CancellationToken},
        workflow::{PHASE_APPLY, PHASE_APPLY_DRY_RUN, PHASE_DIFF, PHASE_REPO, PHASE_ROLLBACK, Workflow},
    },
};
use util::*;

fn workflow(state_dir: &std::path::Path) -> Workflow
{
    let cfg = Config {
        state_dir: state_dir
            .display()
            .to_string(),
        ..Config::default()
    };
    Workflow::new(cfg)
}

#[test]
fn phases_are_recorded_and_apply_cleared_by_rollback()
{
    let tmp = repo(&[("src/A.jsx", "a\n")]);
    let state = assert_fs::TempDir::new().unwrap();
    let wf = workflow(state.path());

    let report = wf
        .apply(
            tmp.path(),
            &[track("src/A.jsx", "trackA")],
            Arc::new(MarkerGen::default()),
            opts(),
            &CancellationToken::new(),
            None,
        )
        .unwrap();
    assert_eq!(report.summary.applied, 1);

    let status = wf.status().unwrap();
    assert!(status.contains_key(PHASE_APPLY));
    assert!(status.contains_key(PHASE_REPO));
    assert_eq!(status[PHASE_APPLY].data["applied"], Value::from(1));

    let saved: ApplyReport = wf
        .state()
        .load_report(PHASE_APPLY)
        .unwrap()
        .unwrap();
    assert_eq!(saved.run_id, report.run_id);

    let diff = wf
        .diff(tmp.path(), None)
        .unwrap();
    assert_eq!(diff.files_changed, 1);
    assert!(
        state
            .path()
            .join("diff_report.json")
            .exists()
    );

    let rb = wf
        .rollback(tmp.path(), true)
        .unwrap();
    assert_eq!(rb.restored_count(), 1);
    let status = wf.status().unwrap();
    assert!(!status.contains_key(PHASE_APPLY));
    assert!(status.contains_key(PHASE_DIFF));
    assert!(status.contains_key(PHASE_ROLLBACK));
    assert!(
        state
            .path()
            .join("rollback_report.json")
            .exists()
    );
}

#[test]
fn dry_run_is_recorded_separately()
{
    let tmp = repo(&[("A.jsx", "a\n")]);
    let state = assert_fs::TempDir::new().unwrap();
    let wf = workflow(state.path());
    let mut options = opts();
    options.dry_run = true;

    wf.apply(
        tmp.path(),
        &[track("A.jsx", "trackA")],
        Arc::new(MarkerGen::default()),
        options,
        &CancellationToken::new(),
        None,
    )
    .unwrap();
    let status = wf.status().unwrap();
    assert!(status.contains_key(PHASE_APPLY_DRY_RUN));
    assert!(!status.contains_key(PHASE_APPLY));
}

#[test]
fn broken_state_dir_does_not_fail_the_run()
{
    let tmp = repo(&[("A.jsx", "a\n")]);
    let state = assert_fs::TempDir::new().unwrap();
    // state_dir points at a regular file, so nothing can be persisted
    let blocker = state
        .path()
        .join("not-a-dir");
    fs::write(&blocker, "x").unwrap();
    let wf = workflow(&blocker);

    let report = wf
        .apply(
            tmp.path(),
            &[track("A.jsx", "trackA")],
            Arc::new(MarkerGen::default()),
            opts(),
            &CancellationToken::new(),
            None,
        )
        .unwrap();
    assert!(report.results[0].applied());
    assert_eq!(read(tmp.path(), "A.jsx"), "a\n// trackA\n");
}

#[test]
fn missing_repo_is_a_configuration_error()
{
    let state = assert_fs::TempDir::new().unwrap();
    let wf = workflow(state.path());
    let err = wf
        .diff(&state.path().join("nope"), None)
        .unwrap_err();
    assert!(matches!(err, tagsafe::core::EngineError::Configuration(_)));
}

#[test]
fn progress_callback_sees_every_result()
{
    use std::sync::atomic::{AtomicUsize, Ordering};

    let tmp = repo(&[("A.jsx", "a\n"), ("B.jsx", "b\n")]);
    let state = assert_fs::TempDir::new().unwrap();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);

    wf_apply_with_progress(&workflow(state.path()), tmp.path(), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

fn wf_apply_with_progress(
    wf: &Workflow,
    root: &std::path::Path,
    f: impl Fn(&tagsafe::core::apply_engine::ApplyResult) + Send + Sync + 'static,
)
{
    wf.apply(
        root,
        &[track("A.jsx", "trackA"), track("B.jsx", "trackB")],
        Arc::new(MarkerGen::default()),
        opts(),
        &CancellationToken::new(),
        Some(Arc::new(f)),
    )
    .unwrap();
}
