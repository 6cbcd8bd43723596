//! CLI runners: turn parsed arguments into workflow calls and render results.

use std::{io::Write, sync::Arc};

use anyhow::{Context, Result, bail};
use clap::CommandFactory;
use clap_complete::Generator;
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::{OwoColorize, Style};
use tabled::{Table, Tabled};
use tracing::warn;

use crate::{
    cli::{AppContext, ApplyArgs, CleanupArgs, Cli, CompletionsArgs, DiffArgs, RollbackArgs, StatusArgs},
    core::{
        apply_engine::{ApplyReport, ApplyResult, ApplyStatus, CancellationToken, ProgressFn},
        diff::{DiffReport, DiffStatus},
        errors::EngineError,
        generator::{CommandGenerator, EditGenerator},
        instruction::{JsonSuggestionSource, SuggestionSource},
        workflow::Workflow,
    },
    infra::{config::Config, io::write_atomic},
};

fn paint(ctx: &AppContext, text: &str, style: Style) -> String {
    if ctx.no_color {
        text.to_string()
    } else {
        text.style(style).to_string()
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serialize output")?);
    Ok(())
}

fn status_label(ctx: &AppContext, status: ApplyStatus) -> String {
    match status {
        ApplyStatus::Applied => paint(ctx, "applied", Style::new().green().bold()),
        ApplyStatus::SkippedAlreadyPresent => paint(ctx, "skipped", Style::new().yellow()),
        ApplyStatus::SkippedNoChange => paint(ctx, "no-change", Style::new().yellow()),
        ApplyStatus::Failed => paint(ctx, "failed", Style::new().red().bold()),
    }
}

fn result_line(ctx: &AppContext, r: &ApplyResult) -> String {
    let detail = r
        .error
        .as_deref()
        .or(r.reason.as_deref())
        .unwrap_or_default();
    let counts = if r.applied() {
        format!(" (+{} -{})", r.lines_added, r.lines_removed)
    } else {
        String::new()
    };
    format!(
        "[{:>3}] {:<9} {}{}  {}",
        r.index,
        status_label(ctx, r.status),
        r.file_path.display(),
        counts,
        detail
    )
}

fn build_generator(
    args: &ApplyArgs,
    config: &Config,
    timeout: Option<std::time::Duration>,
) -> Result<Arc<dyn EditGenerator>> {
    let program = args
        .generator
        .clone()
        .or_else(|| config.generator.command.clone())
        .ok_or_else(|| {
            EngineError::Configuration(
                "no generator configured; set [generator].command or pass --generator".into(),
            )
        })?;
    let program = shellexpand::tilde(&program).into_owned();
    Ok(Arc::new(
        CommandGenerator::new(program, config.generator.args.clone()).with_timeout(timeout),
    ))
}

pub fn apply_run(args: ApplyArgs, ctx: &AppContext, config: &Config) -> Result<()> {
    let source = JsonSuggestionSource::new(&args.suggestions);
    let ingested = source.instructions()?;
    for (idx, err) in &ingested.rejected {
        warn!(item = idx, error = %err, "rejected suggestion");
        if !ctx.quiet {
            eprintln!("{} item {idx}: {err}", paint(ctx, "skip", Style::new().yellow()));
        }
    }

    let mut options = config.apply_options(ctx.dry_run);
    if args.no_skip {
        options.skip_if_already_tagged = false;
    }
    if let Some(n) = args.workers {
        if n == 0 {
            bail!(EngineError::Configuration("--workers must be at least 1".into()));
        }
        options.workers = n;
    }
    if let Some(secs) = args.timeout {
        options.generator_timeout = (secs > 0).then(|| std::time::Duration::from_secs(secs));
    }
    let generator = build_generator(&args, config, options.generator_timeout)?;

    let total = ingested.instructions.len() as u64;
    let progress = if ctx.quiet || args.json {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .context("progress template")?
                .progress_chars("#>-"),
        );
        pb
    };
    let pb = progress.clone();
    let on_result: Arc<ProgressFn> = Arc::new(move |r: &ApplyResult| {
        pb.set_message(r.file_path.display().to_string());
        pb.inc(1);
    });

    let workflow = Workflow::new(config.clone());
    let report = workflow.apply(
        &args.repo,
        &ingested.instructions,
        generator,
        options,
        &CancellationToken::new(),
        Some(on_result),
    )?;
    progress.finish_and_clear();

    if args.json {
        return print_json(&report);
    }
    if !ctx.quiet {
        render_apply(ctx, &report, ingested.rejected.len());
    }
    Ok(())
}

fn render_apply(ctx: &AppContext, report: &ApplyReport, rejected: usize) {
    if report.dry_run {
        println!("{}", paint(ctx, "DRY RUN: nothing was written", Style::new().yellow()));
    }
    for r in &report.results {
        println!("{}", result_line(ctx, r));
        if let Some(preview) = &r.preview_diff {
            print!("{}", colorize_diff(ctx, preview));
        }
    }
    let s = &report.summary;
    println!(
        "{} {} applied, {} skipped, {} failed (+{} -{}), {} backups created{}{}",
        paint(ctx, "✓", Style::new().green()),
        s.applied,
        s.skipped(),
        s.failed,
        s.lines_added,
        s.lines_removed,
        s.backups_created,
        if s.unprocessed > 0 {
            format!(", {} not processed (cancelled)", s.unprocessed)
        } else {
            String::new()
        },
        if rejected > 0 {
            format!(", {rejected} suggestions rejected")
        } else {
            String::new()
        },
    );
    println!("run {}", report.run_id);
}

fn colorize_diff(ctx: &AppContext, diff: &str) -> String {
    let mut out = String::with_capacity(diff.len());
    for line in diff.lines() {
        let painted = if line.starts_with("+++") || line.starts_with("---") {
            paint(ctx, line, Style::new().bold())
        } else if line.starts_with('+') {
            paint(ctx, line, Style::new().green())
        } else if line.starts_with('-') {
            paint(ctx, line, Style::new().red())
        } else if line.starts_with("@@") {
            paint(ctx, line, Style::new().cyan())
        } else {
            line.to_string()
        };
        out.push_str(&painted);
        out.push('\n');
    }
    out
}

#[derive(Tabled)]
struct DiffRow {
    file: String,
    status: String,
    added: usize,
    removed: usize,
}

pub fn diff_run(args: DiffArgs, ctx: &AppContext, config: &Config) -> Result<()> {
    if let Some(n) = args.context
        && n > 1000
    {
        bail!(EngineError::Configuration("--context must be at most 1000".into()));
    }
    let workflow = Workflow::new(config.clone());
    let report = workflow.diff(&args.repo, args.context)?;

    if args.json {
        return print_json(&report);
    }
    if args.stat {
        println!("{}", diff_table(&report));
    } else {
        for f in &report.files {
            match f.status {
                DiffStatus::Unreadable => eprintln!(
                    "{} {}: {}",
                    paint(ctx, "unreadable", Style::new().red()),
                    f.path.display(),
                    f.error.as_deref().unwrap_or_default()
                ),
                DiffStatus::OriginalMissing => {
                    println!(
                        "{} {} (original missing)",
                        paint(ctx, "!", Style::new().yellow()),
                        f.path.display()
                    );
                    print!("{}", colorize_diff(ctx, &f.diff));
                }
                _ => print!("{}", colorize_diff(ctx, &f.diff)),
            }
        }
    }
    if !ctx.quiet {
        println!(
            "{} files with backups, {} changed, +{} -{}",
            report.total_files, report.files_changed, report.total_added, report.total_removed
        );
    }
    Ok(())
}

fn diff_table(report: &DiffReport) -> String {
    let rows: Vec<DiffRow> = report
        .files
        .iter()
        .map(|f| DiffRow {
            file: f.path.display().to_string(),
            status: serde_json::to_value(f.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            added: f.added,
            removed: f.removed,
        })
        .collect();
    Table::new(rows).to_string()
}

pub fn rollback_run(args: RollbackArgs, ctx: &AppContext, config: &Config) -> Result<()> {
    let workflow = Workflow::new(config.clone());

    if ctx.dry_run {
        let scan = workflow.rollback_preview(&args.repo)?;
        if args.json {
            return print_json(&scan);
        }
        println!(
            "{}",
            paint(ctx, &format!("DRY RUN: would restore {} files", scan.total()), Style::new().yellow())
        );
        for pair in scan.all() {
            println!("  {} <- {}", pair.original.display(), pair.backup.display());
        }
        return Ok(());
    }

    let report = workflow.rollback(&args.repo, args.delete_backups)?;
    if args.json {
        print_json(&report)?;
    } else if !ctx.quiet {
        for p in &report.restored {
            println!("{} {}", paint(ctx, "restored", Style::new().green()), p.display());
        }
        for f in &report.failures {
            println!("{} {}: {}", paint(ctx, "failed", Style::new().red().bold()), f.path.display(), f.error);
        }
        println!(
            "{} restored, {} backups deleted, {} failed",
            report.restored_count(),
            report.deleted_backups,
            report.failures.len()
        );
    }
    if !report.success() {
        bail!(
            "rollback left {} file(s) needing manual attention",
            report.failures.len()
        );
    }
    Ok(())
}

pub fn cleanup_run(args: CleanupArgs, ctx: &AppContext, config: &Config) -> Result<()> {
    let workflow = Workflow::new(config.clone());
    if ctx.dry_run {
        let scan = workflow.rollback_preview(&args.repo)?;
        if args.json {
            return print_json(&scan);
        }
        for pair in scan.all() {
            println!("would delete {}", pair.backup.display());
        }
        return Ok(());
    }

    let out = workflow.cleanup(&args.repo)?;
    if args.json {
        print_json(&out)?;
    } else if !ctx.quiet {
        println!("{} deleted {} backups", paint(ctx, "✓", Style::new().green()), out.deleted.len());
        for (p, e) in &out.failures {
            println!("{} {}: {e}", paint(ctx, "failed", Style::new().red()), p.display());
        }
    }
    if !out.failures.is_empty() {
        bail!("{} backup(s) could not be deleted", out.failures.len());
    }
    Ok(())
}

#[derive(Tabled)]
struct PhaseRow {
    phase: String,
    updated: String,
    summary: String,
}

pub fn status_run(args: StatusArgs, ctx: &AppContext, config: &Config) -> Result<()> {
    let workflow = Workflow::new(config.clone());
    let status = workflow.status()?;

    if args.json {
        return print_json(&status);
    }
    if status.is_empty() {
        if !ctx.quiet {
            println!("No workflow phases recorded in {}", workflow.state().state_dir().display());
        }
        return Ok(());
    }
    let rows: Vec<PhaseRow> = status
        .iter()
        .map(|(phase, rec)| PhaseRow {
            phase: phase.clone(),
            updated: rec.updated_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            summary: rec.data.to_string(),
        })
        .collect();
    println!("{}", Table::new(rows));
    Ok(())
}

/// Completion script for `shell`, printed or written into `--out-dir`.
pub fn completions_run(args: CompletionsArgs, ctx: &AppContext) -> Result<()> {
    let bin = env!("CARGO_PKG_NAME");
    let mut script = Vec::new();
    clap_complete::generate(args.shell, &mut Cli::command(), bin, &mut script);

    let Some(dir) = args.out_dir.filter(|_| !args.stdout) else {
        std::io::stdout()
            .write_all(&script)
            .context("write completion script")?;
        return Ok(());
    };
    let path = dir.join(args.shell.file_name(bin));
    if ctx.dry_run {
        println!("would write {} completions to {}", args.shell, path.display());
        return Ok(());
    }
    std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    write_atomic(&path, &script)?;
    if !ctx.quiet {
        println!("{} {}", paint(ctx, "wrote", Style::new().green()), path.display());
    }
    Ok(())
}
