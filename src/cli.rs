use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Shared application context for global flags
#[derive(Clone, Debug)]
pub struct AppContext {
    pub quiet: bool,    // global --quiet
    pub no_color: bool, // global --no-color
    pub dry_run: bool,  // global --dry-run
}

#[derive(Parser)]
#[command(name = "tagsafe")]
#[command(
    about = "Apply generated analytics-tagging edits with per-file backups, diffs and rollback"
)]
#[command(version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Suppress progress bars and non-essential output
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Show what would be done without executing
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (default: ./tagsafe.toml or ./.tagsafe.toml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply suggested tagging edits to a repository
    Apply(ApplyArgs),

    /// Show unified diffs between backups and current files
    Diff(DiffArgs),

    /// Restore every file from its backup
    Rollback(RollbackArgs),

    /// Delete all backups without restoring
    Cleanup(CleanupArgs),

    /// Show recorded workflow phases
    Status(StatusArgs),

    /// Initialize a tagsafe.toml config file
    Init(InitArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Suggestions / apply-plan JSON file
    pub suggestions: PathBuf,

    /// Repository root the suggestion paths are relative to
    #[arg(long)]
    pub repo: PathBuf,

    /// Generate even when the tag marker is already present
    #[arg(long)]
    pub no_skip: bool,

    /// Process distinct files in parallel with N workers
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Per-call generator timeout in seconds (0 = none)
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Generator command (overrides [generator].command)
    #[arg(long, value_name = "PROGRAM")]
    pub generator: Option<String>,

    /// Emit the full report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Repository root to scan for backups
    #[arg(long)]
    pub repo: PathBuf,

    /// Context lines around each hunk
    #[arg(long, value_name = "N")]
    pub context: Option<usize>,

    /// Only print per-file counts
    #[arg(long)]
    pub stat: bool,

    /// Emit the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct RollbackArgs {
    /// Repository root to restore
    #[arg(long)]
    pub repo: PathBuf,

    /// Delete backups after a successful restore
    #[arg(long)]
    pub delete_backups: bool,

    /// Emit the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct CleanupArgs {
    /// Repository root to clean
    #[arg(long)]
    pub repo: PathBuf,

    /// Emit JSON result instead of human text
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser)]
pub struct InitArgs {
    /// Directory to initialize config in
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Overwrite existing config file
    #[arg(long)]
    pub force: bool,
}

#[derive(Parser)]
pub struct CompletionsArgs {
    /// Target shell
    #[arg(value_enum)]
    pub shell: clap_complete::Shell,

    /// Directory to write `<shell file name>` into (required without --stdout)
    #[arg(long, required_unless_present = "stdout")]
    pub out_dir: Option<PathBuf>,

    /// Print the completion script instead of writing a file
    #[arg(long)]
    pub stdout: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_apply_with_globals_anywhere() {
        let cli = Cli::try_parse_from([
            "tagsafe",
            "-vv",
            "apply",
            "plan.json",
            "--repo",
            "/tmp/r",
            "--workers",
            "4",
            "--dry-run",
            "--json",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.dry_run);
        match cli.command {
            Commands::Apply(a) => {
                assert_eq!(a.suggestions, PathBuf::from("plan.json"));
                assert_eq!(a.workers, Some(4));
                assert!(a.json);
                assert!(!a.no_skip);
            }
            _ => panic!("expected apply"),
        }
    }

    #[test]
    fn repo_is_required() {
        assert!(Cli::try_parse_from(["tagsafe", "diff"]).is_err());
        assert!(Cli::try_parse_from(["tagsafe", "rollback"]).is_err());
    }

    #[test]
    fn completions_need_a_destination() {
        assert!(Cli::try_parse_from(["tagsafe", "completions", "zsh"]).is_err());
        let cli = Cli::try_parse_from(["tagsafe", "completions", "powershell", "--stdout"]).unwrap();
        match cli.command {
            Commands::Completions(a) => assert_eq!(a.shell, clap_complete::Shell::PowerShell),
            _ => panic!("expected completions"),
        }
    }

    #[test]
    fn command_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
