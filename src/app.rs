use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

use crate::cache::{CacheOptions, CacheStore};
use crate::config::{self, IndexConfig};
use crate::discovery::{list_project_dirs, list_source_files, project_dir_for};
use crate::filter::NaturalDateResolver;
use crate::project::{ProjectRollup, ProjectScan, scan_project, scan_projects};
use crate::util::{format_range, format_timestamp, format_tokens, one_line};

const TITLE_WIDTH: usize = 72;

/// What a command operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Project(PathBuf),
    AllProjects(PathBuf),
}

impl Target {
    /// A directory holding transcripts is used as-is; anything else is treated as a
    /// working directory and mapped into the projects directory.
    pub fn resolve(path: Option<PathBuf>, all_projects: bool) -> Result<Self> {
        if all_projects {
            return Ok(Self::AllProjects(path.unwrap_or_else(config::projects_path)));
        }
        let path = match path {
            Some(path) => path,
            None => env::current_dir().context("failed to read current directory")?,
        };
        if list_source_files(&path).is_ok_and(|files| !files.is_empty()) {
            return Ok(Self::Project(path));
        }
        Ok(Self::Project(project_dir_for(&config::projects_path(), &path)))
    }

    fn project_dirs(&self) -> Result<Vec<PathBuf>> {
        match self {
            Self::Project(dir) => Ok(vec![dir.clone()]),
            Self::AllProjects(root) => list_project_dirs(root)
                .with_context(|| format!("failed to list projects in {}", root.display())),
        }
    }
}

pub fn scan(
    config: &IndexConfig,
    target: &Target,
    from: Option<&str>,
    to: Option<&str>,
    no_cache: bool,
) -> Result<u8> {
    let mut options = config
        .scan_options()
        .with_date_phrases(from, to, &NaturalDateResolver, Utc::now())?;
    options.use_cache = !no_cache;

    match target {
        Target::Project(dir) => {
            let scan = scan_project(dir, &options)
                .with_context(|| format!("failed to scan {}", dir.display()))?;
            print_project(&scan, true);
            Ok(0)
        }
        Target::AllProjects(root) => {
            let overview = scan_projects(root, &options)
                .with_context(|| format!("failed to scan projects in {}", root.display()))?;
            for scan in &overview.projects {
                print_project(scan, false);
                println!();
            }
            println!("all projects: {}", overview.projects.len());
            print_rollup(&overview.rollup);
            for failure in &overview.failures {
                println!("[WARN] {}: {}", failure.path.display(), failure.reason);
            }
            Ok(0)
        }
    }
}

pub fn print_stats(config: &IndexConfig, target: &Target) -> Result<u8> {
    let options = cache_options(config);
    for dir in target.project_dirs()? {
        let Some(store) = open_store(target, &dir, &options)? else {
            continue;
        };
        let stats = store.stats();
        println!("project: {}", dir.display());
        println!("cache_dir: {}", stats.cache_dir.display());
        println!("cached_files: {}", stats.cached_files);
        println!("cached_records: {}", stats.cached_records);
        println!("sessions: {}", stats.sessions);
        println!("index_entries: {}", stats.index_entries);
        println!("updated_at: {}", format_timestamp(Some(stats.updated_at)));
    }
    Ok(0)
}

pub fn clear_cache(config: &IndexConfig, target: &Target) -> Result<u8> {
    let options = cache_options(config);
    for dir in target.project_dirs()? {
        let Some(mut store) = open_store(target, &dir, &options)? else {
            continue;
        };
        let removed = store
            .clear()
            .with_context(|| format!("failed to clear cache for {}", dir.display()))?;
        println!("cleared {removed} cache file(s) in {}", store.cache_dir().display());
    }
    Ok(0)
}

fn cache_options(config: &IndexConfig) -> CacheOptions {
    config.scan_options().cache
}

/// A single project's cache must open; across all projects a broken one is reported and skipped.
fn open_store(target: &Target, dir: &Path, options: &CacheOptions) -> Result<Option<CacheStore>> {
    match CacheStore::open(dir, options.clone()) {
        Ok(store) => Ok(Some(store)),
        Err(err) if matches!(target, Target::AllProjects(_)) => {
            println!("[WARN] {}: {err}", dir.display());
            Ok(None)
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to open cache for {}", dir.display()))
        }
    }
}

fn print_project(scan: &ProjectScan, detailed: bool) {
    println!("project: {} ({})", scan.display_name, scan.path.display());
    print_rollup(&scan.rollup);
    println!("cache: {} hit(s), {} miss(es)", scan.cache_hits, scan.cache_misses);
    if detailed {
        for session in scan.sessions.values() {
            println!(
                "  {:<8}  {}  {:>5} records  {:>7} tokens  {}",
                short_id(&session.id),
                format_range(session.first_timestamp, session.last_timestamp),
                session.record_count(),
                format_tokens(session.tokens.total()),
                one_line(&session.display_title(), TITLE_WIDTH),
            );
        }
    }
    if !scan.orphans.is_empty() {
        println!("orphan_summaries: {}", scan.orphans.len());
        if detailed {
            for orphan in &scan.orphans {
                println!(
                    "  - {} ({}:{})",
                    one_line(&orphan.text, TITLE_WIDTH),
                    file_name(&orphan.source),
                    orphan.line
                );
            }
        }
    }
    println!("diagnostics: {}", scan.diagnostics.summary_line());
    for failure in &scan.diagnostics.file_failures {
        println!("[WARN] {}: {}", failure.path.display(), failure.reason);
    }
}

fn print_rollup(rollup: &ProjectRollup) {
    println!(
        "sessions: {}  records: {}  tokens: {} (in {}, out {}, cache write {}, cache read {})",
        rollup.sessions,
        rollup.records,
        format_tokens(rollup.tokens.total()),
        format_tokens(rollup.tokens.input_tokens),
        format_tokens(rollup.tokens.output_tokens),
        format_tokens(rollup.tokens.cache_creation_tokens),
        format_tokens(rollup.tokens.cache_read_tokens),
    );
    println!(
        "range: {}",
        format_range(rollup.first_timestamp, rollup.last_timestamp)
    );
}

fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
