use anyhow::Result;
use clap::Parser;
use tagsafe::{
    cli::{AppContext, Cli, Commands},
    core::commands,
    infra::{config, logging},
};

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.quiet, cli.no_color);

    // Build a context once, pass everywhere
    let ctx = AppContext {
        quiet: cli.quiet,
        no_color: cli.no_color,
        dry_run: cli.dry_run,
    };

    // Configuration errors are fatal before any repository I/O
    let load = || config::load_config(cli.config.as_deref());

    match cli.command {
        Commands::Apply(args) => commands::apply_run(args, &ctx, &load()?),
        Commands::Diff(args) => commands::diff_run(args, &ctx, &load()?),
        Commands::Rollback(args) => commands::rollback_run(args, &ctx, &load()?),
        Commands::Cleanup(args) => commands::cleanup_run(args, &ctx, &load()?),
        Commands::Status(args) => commands::status_run(args, &ctx, &load()?),
        Commands::Init(args) => config::init(args, &ctx),
        Commands::Completions(args) => commands::completions_run(args, &ctx),
    }
}
