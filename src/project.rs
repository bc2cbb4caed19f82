use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::cache::{CacheOptions, CacheStore, FileMetadata, Fingerprint, TimestampIndex};
use crate::diagnostics::{DiagnosticKind, Diagnostics, FileFailure};
use crate::discovery::{list_project_dirs, list_source_files, project_display_name};
use crate::error::ScanError;
use crate::filter::{DateRange, DateResolver, filter_sessions};
use crate::record::{Record, RecordKind, TokenUsage, load_file};
use crate::session::{
    DEFAULT_FIRST_MESSAGE_CHARS, Session, SessionAccumulator, assemble_sessions,
    compare_record_time, max_datetime, min_datetime,
};
use crate::summary::{MessageIndex, OrphanSummary, match_summaries};

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub use_cache: bool,
    pub cache: CacheOptions,
    pub range: DateRange,
    pub first_message_chars: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            cache: CacheOptions::default(),
            range: DateRange::unbounded(),
            first_message_chars: DEFAULT_FIRST_MESSAGE_CHARS,
        }
    }
}

impl ScanOptions {
    pub fn with_date_phrases(
        mut self,
        from: Option<&str>,
        to: Option<&str>,
        resolver: &dyn DateResolver,
        now: DateTime<Utc>,
    ) -> Result<Self, ScanError> {
        self.range = DateRange::resolve(from, to, resolver, now)?;
        Ok(self)
    }
}

/// Totals over a set of sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectRollup {
    pub sessions: usize,
    pub records: usize,
    pub tokens: TokenUsage,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

impl ProjectRollup {
    pub fn from_sessions(sessions: &BTreeMap<String, Session>) -> Self {
        let mut rollup = Self::default();
        for session in sessions.values() {
            rollup.sessions += 1;
            rollup.records += session.record_count();
            rollup.tokens.add(&session.tokens);
            rollup.first_timestamp = min_datetime(rollup.first_timestamp, session.first_timestamp);
            rollup.last_timestamp = max_datetime(rollup.last_timestamp, session.last_timestamp);
        }
        rollup
    }

    pub fn absorb(&mut self, other: &ProjectRollup) {
        self.sessions += other.sessions;
        self.records += other.records;
        self.tokens.add(&other.tokens);
        self.first_timestamp = min_datetime(self.first_timestamp, other.first_timestamp);
        self.last_timestamp = max_datetime(self.last_timestamp, other.last_timestamp);
    }
}

#[derive(Debug, Clone)]
pub struct ProjectScan {
    pub name: String,
    pub display_name: String,
    pub path: PathBuf,
    pub sessions: BTreeMap<String, Session>,
    pub orphans: Vec<OrphanSummary>,
    pub index: TimestampIndex,
    pub rollup: ProjectRollup,
    pub diagnostics: Diagnostics,
    pub working_directories: Vec<String>,
    pub cache_hits: usize,
    pub cache_misses: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectsOverview {
    pub projects: Vec<ProjectScan>,
    pub rollup: ProjectRollup,
    pub failures: Vec<FileFailure>,
}

struct SourceFile {
    path: PathBuf,
    fingerprint: Option<Fingerprint>,
    metadata: FileMetadata,
    records: Option<Vec<Record>>,
}

#[derive(Default)]
struct CacheCounters {
    hits: usize,
    misses: usize,
}

/// Run the whole pipeline over one project directory.
pub fn scan_project(project_dir: &Path, options: &ScanOptions) -> Result<ProjectScan, ScanError> {
    let paths = list_source_files(project_dir)?;
    let mut cache = if options.use_cache {
        match CacheStore::open(project_dir, options.cache.clone()) {
            Ok(store) => Some(store),
            Err(err) => {
                warn!(project = %project_dir.display(), error = %err, "cache unavailable, parsing every file");
                None
            }
        }
    } else {
        None
    };

    let mut diagnostics = Diagnostics::default();
    let mut counters = CacheCounters::default();
    let mut files = Vec::with_capacity(paths.len());
    for path in &paths {
        match ingest(path, cache.as_mut(), options, &mut counters) {
            Ok(file) => {
                diagnostics.merge(&file.metadata.diagnostics);
                files.push(file);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable transcript");
                diagnostics.record_file_failure(path, &err);
            }
        }
    }

    if let Some(store) = cache.as_mut()
        && let Err(err) = store.rebuild_index(&paths)
    {
        warn!(project = %project_dir.display(), error = %err, "could not persist cache index");
    }

    let index = TimestampIndex::from_metadata(files.iter().map(|file| &file.metadata));

    let mut messages = MessageIndex::default();
    for file in &files {
        messages.extend(&file.metadata.messages);
    }
    let summaries = files
        .iter()
        .flat_map(|file| file.metadata.summaries.iter().cloned())
        .collect();
    let matches = match_summaries(&messages, summaries);
    diagnostics.record_many(DiagnosticKind::OrphanSummary, matches.orphans.len());

    let candidates: BTreeSet<String> = if options.range.is_unbounded() {
        files
            .iter()
            .flat_map(|file| file.metadata.sessions.keys().cloned())
            .collect()
    } else {
        options.range.candidate_sessions(&index)
    };

    let mut loaded = Vec::new();
    for file in &mut files {
        if !file.metadata.sessions.keys().any(|id| candidates.contains(id)) {
            continue;
        }
        match records_for(file, cache.as_mut(), options.first_message_chars) {
            Ok(records) => loaded.push((file.path.clone(), records)),
            Err(err) => {
                warn!(path = %file.path.display(), error = %err, "transcript vanished while scanning");
                diagnostics.record_file_failure(&file.path, &err);
            }
        }
    }

    let mut sessions = merge_sessions(
        &loaded,
        |id| candidates.contains(id),
        options.first_message_chars,
    );
    matches.apply(&mut sessions);
    let sessions = filter_sessions(sessions, &options.range, options.first_message_chars);

    if let Some(store) = cache.as_mut() {
        diagnostics.merge(&store.take_diagnostics());
    }

    let working_directories: Vec<String> = files
        .iter()
        .flat_map(|file| file.metadata.sessions.values())
        .filter_map(|session| session.cwd.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let name = project_dir
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| project_dir.display().to_string());

    debug!(
        project = %name,
        files = files.len(),
        hits = counters.hits,
        misses = counters.misses,
        sessions = sessions.len(),
        "project scanned"
    );

    Ok(ProjectScan {
        display_name: project_display_name(&name, &working_directories),
        name,
        path: project_dir.to_path_buf(),
        rollup: ProjectRollup::from_sessions(&sessions),
        sessions,
        orphans: matches.orphans,
        index,
        diagnostics,
        working_directories,
        cache_hits: counters.hits,
        cache_misses: counters.misses,
    })
}

/// Scan every project under `projects_root`. A failing project is reported and skipped.
pub fn scan_projects(projects_root: &Path, options: &ScanOptions) -> Result<ProjectsOverview, ScanError> {
    let mut overview = ProjectsOverview::default();
    for dir in list_project_dirs(projects_root)? {
        match scan_project(&dir, options) {
            Ok(scan) => {
                overview.rollup.absorb(&scan.rollup);
                overview.projects.push(scan);
            }
            Err(err) => {
                warn!(project = %dir.display(), error = %err, "skipping project");
                overview.failures.push(FileFailure {
                    path: dir,
                    reason: err.to_string(),
                });
            }
        }
    }
    info!(
        projects = overview.projects.len(),
        sessions = overview.rollup.sessions,
        "projects scanned"
    );
    Ok(overview)
}

/// Merge per-file records into sessions, keeping sessions accepted by `keep_session`.
///
/// A message id seen more than once in a session keeps a single copy: one with a
/// timestamp if any has it, otherwise the one from the lowest source path. Records are
/// ordered by timestamp, then source path, then line.
pub fn merge_sessions<F>(
    files: &[(PathBuf, Vec<Record>)],
    keep_session: F,
    first_message_chars: usize,
) -> BTreeMap<String, Session>
where
    F: Fn(&str) -> bool,
{
    let mut ordered: Vec<&(PathBuf, Vec<Record>)> = files.iter().collect();
    ordered.sort_by(|a, b| a.0.cmp(&b.0));

    let mut buckets: BTreeMap<String, Vec<(&Path, &Record)>> = BTreeMap::new();
    let mut sources: BTreeMap<String, BTreeSet<&Path>> = BTreeMap::new();
    let mut seen: HashMap<(String, String), usize> = HashMap::new();

    for (path, records) in ordered {
        for record in records {
            let session_id = record.session_key();
            if record.kind() == RecordKind::Summary || !keep_session(session_id) {
                continue;
            }
            sources
                .entry(session_id.to_string())
                .or_default()
                .insert(path.as_path());
            let bucket = buckets.entry(session_id.to_string()).or_default();

            if let Some(uuid) = &record.uuid {
                let key = (session_id.to_string(), uuid.clone());
                if let Some(&at) = seen.get(&key) {
                    if bucket[at].1.timestamp.is_none() && record.timestamp.is_some() {
                        bucket[at] = (path.as_path(), record);
                    }
                    continue;
                }
                seen.insert(key, bucket.len());
            }
            bucket.push((path.as_path(), record));
        }
    }

    buckets
        .into_iter()
        .map(|(id, mut bucket)| {
            bucket.sort_by(|(left_path, left), (right_path, right)| {
                compare_record_time(left, right)
                    .then_with(|| left_path.cmp(right_path))
                    .then_with(|| left.line.cmp(&right.line))
            });
            let mut accumulator = SessionAccumulator::new(&id);
            for path in sources.remove(&id).unwrap_or_default() {
                accumulator.add_source(path);
            }
            for (_, record) in bucket {
                accumulator.apply_record(record.clone());
            }
            (id, accumulator.finish(first_message_chars))
        })
        .collect()
}

fn ingest(
    path: &Path,
    cache: Option<&mut CacheStore>,
    options: &ScanOptions,
    counters: &mut CacheCounters,
) -> io::Result<SourceFile> {
    let Some(store) = cache else {
        let (metadata, records) = parse_source(path, options.first_message_chars)?;
        return Ok(SourceFile {
            path: path.to_path_buf(),
            fingerprint: None,
            metadata,
            records: Some(records),
        });
    };

    let fingerprint = store.fingerprint(path)?;
    if store.validate_fingerprint(path, &fingerprint).is_hit()
        && let Ok(metadata) = store.load(path)
    {
        counters.hits += 1;
        return Ok(SourceFile {
            path: path.to_path_buf(),
            fingerprint: Some(fingerprint),
            metadata,
            records: None,
        });
    }

    counters.misses += 1;
    let (metadata, records) = parse_source(path, options.first_message_chars)?;
    if let Err(err) = store.store(path, &fingerprint, &metadata, &records) {
        warn!(path = %path.display(), error = %err, "could not write cache record");
    }
    Ok(SourceFile {
        path: path.to_path_buf(),
        fingerprint: Some(fingerprint),
        metadata,
        records: Some(records),
    })
}

fn records_for(
    file: &mut SourceFile,
    cache: Option<&mut CacheStore>,
    first_message_chars: usize,
) -> io::Result<Vec<Record>> {
    if let Some(records) = file.records.take() {
        return Ok(records);
    }
    if let (Some(store), Some(fingerprint)) = (cache, file.fingerprint.as_ref()) {
        match store.load_records(&file.path, fingerprint) {
            Ok(records) => return Ok(records),
            Err(err) => {
                warn!(path = %file.path.display(), error = %err, "cached records unusable, reparsing");
                let (metadata, records) = parse_source(&file.path, first_message_chars)?;
                if let Err(err) = store.store(&file.path, fingerprint, &metadata, &records) {
                    warn!(path = %file.path.display(), error = %err, "could not write cache record");
                }
                return Ok(records);
            }
        }
    }
    parse_source(&file.path, first_message_chars).map(|(_, records)| records)
}

fn parse_source(path: &Path, first_message_chars: usize) -> io::Result<(FileMetadata, Vec<Record>)> {
    let parse = load_file(path)?;
    let sessions = assemble_sessions(parse.records.iter().cloned(), Some(path), first_message_chars);
    let metadata = FileMetadata::build(path, &parse, &sessions);
    Ok((metadata, parse.records))
}
