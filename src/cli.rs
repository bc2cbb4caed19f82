use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "claude-log-index",
    version,
    about = "Assemble and cache sessions from Claude Code transcript archives"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Assemble sessions for a project and print them with rollup statistics.
    Scan {
        /// Project directory, or a working directory whose project should be scanned.
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,
        /// Keep records at or after this date ("2025-06-01", "yesterday", "3 days ago").
        #[arg(long)]
        from: Option<String>,
        /// Keep records at or before this date.
        #[arg(long)]
        to: Option<String>,
        /// Scan every project under the projects directory (or PATH).
        #[arg(long)]
        all_projects: bool,
        /// Parse every file without reading or writing the cache.
        #[arg(long)]
        no_cache: bool,
    },
    /// Print cache statistics for a project.
    Stats {
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,
    },
    /// Delete cached session data.
    ClearCache {
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,
        #[arg(long)]
        all_projects: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_flags_parse() {
        let cli = Cli::try_parse_from([
            "claude-log-index",
            "scan",
            "/tmp/project",
            "--from",
            "yesterday",
            "--no-cache",
        ])
        .expect("parse");
        match cli.command {
            Commands::Scan {
                path,
                from,
                to,
                all_projects,
                no_cache,
            } => {
                assert_eq!(path, Some(PathBuf::from("/tmp/project")));
                assert_eq!(from.as_deref(), Some("yesterday"));
                assert_eq!(to, None);
                assert!(!all_projects);
                assert!(no_cache);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn clear_cache_accepts_all_projects() {
        let cli = Cli::try_parse_from(["claude-log-index", "clear-cache", "--all-projects"])
            .expect("parse");
        assert!(matches!(
            cli.command,
            Commands::ClearCache {
                path: None,
                all_projects: true
            }
        ));
    }
}
