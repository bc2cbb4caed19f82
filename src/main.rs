use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use claude_log_index::app::{self, Target};
use claude_log_index::cli::{Cli, Commands};
use claude_log_index::config::IndexConfig;
use claude_log_index::util::setup_tracing;

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("claude-log-index error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<u8> {
    setup_tracing();
    let cli = Cli::parse();
    let config = IndexConfig::load_or_init()?;

    match cli.command {
        Commands::Scan {
            path,
            from,
            to,
            all_projects,
            no_cache,
        } => {
            let target = Target::resolve(path, all_projects)?;
            app::scan(&config, &target, from.as_deref(), to.as_deref(), no_cache)
        }
        Commands::Stats { path } => {
            let target = Target::resolve(path, false)?;
            app::print_stats(&config, &target)
        }
        Commands::ClearCache { path, all_projects } => {
            let target = Target::resolve(path, all_projects)?;
            app::clear_cache(&config, &target)
        }
    }
}
