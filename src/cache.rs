use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::error::CacheError;
use crate::record::{FileParse, Record};
use crate::session::{Session, SessionMetadata};
use crate::summary::{MessageRef, SummaryEntry, message_refs};

/// Bumped whenever the on-disk layout or the derived metadata changes meaning.
pub const CACHE_FORMAT_VERSION: u32 = 1;
pub const DEFAULT_CACHE_DIR_NAME: &str = "cache";
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

const INDEX_FILE: &str = "index.json";
const INDEX_LOCK_FILE: &str = "index.lock";
const FILES_DIR: &str = "files";
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintMode {
    #[default]
    Stat,
    ContentHash,
}

impl FingerprintMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stat" | "mtime" => Some(Self::Stat),
            "content_hash" | "content-hash" | "hash" | "sha256" => Some(Self::ContentHash),
            _ => None,
        }
    }
}

/// Observed identity of a source file, compared to decide staleness.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Fingerprint {
    Stat {
        size: u64,
        modified_secs: i64,
        modified_nanos: u32,
    },
    ContentHash {
        size: u64,
        sha256: String,
    },
}

impl Fingerprint {
    pub fn compute(path: &Path, mode: FingerprintMode) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        match mode {
            FingerprintMode::Stat => {
                let modified = metadata.modified()?;
                let (modified_secs, modified_nanos) = match modified.duration_since(UNIX_EPOCH) {
                    Ok(since) => (since.as_secs() as i64, since.subsec_nanos()),
                    Err(before) => (-(before.duration().as_secs() as i64), 0),
                };
                Ok(Self::Stat {
                    size: metadata.len(),
                    modified_secs,
                    modified_nanos,
                })
            }
            FingerprintMode::ContentHash => {
                let mut file = File::open(path)?;
                let mut hasher = Sha256::new();
                let size = io::copy(&mut file, &mut hasher)?;
                Ok(Self::ContentHash {
                    size,
                    sha256: hex_digest(&hasher.finalize()),
                })
            }
        }
    }
}

/// Everything the project pipeline needs from one source file without reading its records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct FileMetadata {
    pub record_count: usize,
    pub sessions: BTreeMap<String, SessionMetadata>,
    pub messages: BTreeMap<String, MessageRef>,
    pub summaries: Vec<SummaryEntry>,
    pub diagnostics: Diagnostics,
}

impl FileMetadata {
    pub fn build(source: &Path, parse: &FileParse, sessions: &BTreeMap<String, Session>) -> Self {
        Self {
            record_count: parse.records.len(),
            sessions: sessions
                .iter()
                .map(|(id, session)| (id.clone(), session.metadata()))
                .collect(),
            messages: message_refs(&parse.records),
            summaries: parse
                .records
                .iter()
                .filter_map(|record| SummaryEntry::from_record(record, source))
                .collect(),
            diagnostics: parse.diagnostics.clone(),
        }
    }
}

/// Per-file cache record as written under `files/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    pub format_version: u32,
    pub file_path: PathBuf,
    pub fingerprint: Fingerprint,
    pub cached_at: DateTime<Utc>,
    pub metadata: FileMetadata,
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexedFile {
    pub file_path: PathBuf,
    pub fingerprint: Fingerprint,
    pub metadata: FileMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexEntry {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
}

/// Sorted (timestamp, session id) pairs for range queries without loading records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct TimestampIndex {
    entries: Vec<IndexEntry>,
}

impl TimestampIndex {
    pub fn from_entries(mut entries: Vec<IndexEntry>) -> Self {
        entries.sort();
        entries.dedup();
        Self { entries }
    }

    pub fn from_metadata<'a, I>(files: I) -> Self
    where
        I: IntoIterator<Item = &'a FileMetadata>,
    {
        let entries = files
            .into_iter()
            .flat_map(|metadata| metadata.sessions.values())
            .flat_map(|session| {
                session.timestamps.iter().map(|timestamp| IndexEntry {
                    timestamp: *timestamp,
                    session_id: session.id.clone(),
                })
            })
            .collect();
        Self::from_entries(entries)
    }

    /// Sessions with at least one timestamp inside the closed interval.
    pub fn sessions_between(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> BTreeSet<String> {
        let start = match from {
            Some(from) => self.entries.partition_point(|entry| entry.timestamp < from),
            None => 0,
        };
        let end = match to {
            Some(to) => self.entries.partition_point(|entry| entry.timestamp <= to),
            None => self.entries.len(),
        };
        if start >= end {
            return BTreeSet::new();
        }
        self.entries[start..end]
            .iter()
            .map(|entry| entry.session_id.clone())
            .collect()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn earliest(&self) -> Option<DateTime<Utc>> {
        self.entries.first().map(|entry| entry.timestamp)
    }

    pub fn latest(&self) -> Option<DateTime<Utc>> {
        self.entries.last().map(|entry| entry.timestamp)
    }
}

/// The project-wide store written to `index.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectIndex {
    pub format_version: u32,
    pub project_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub files: BTreeMap<String, IndexedFile>,
    pub timestamp_index: TimestampIndex,
}

impl ProjectIndex {
    fn empty(project_path: &Path) -> Self {
        let now = Utc::now();
        Self {
            format_version: CACHE_FORMAT_VERSION,
            project_path: project_path.to_path_buf(),
            created_at: now,
            updated_at: now,
            files: BTreeMap::new(),
            timestamp_index: TimestampIndex::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VersionProbe {
    format_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    Absent,
    VersionMismatch,
    Stale,
    Corrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss(MissReason),
}

impl CacheStatus {
    pub fn is_hit(self) -> bool {
        matches!(self, Self::Hit)
    }
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub cache_dir_name: String,
    pub fingerprint_mode: FingerprintMode,
    pub lock_timeout: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            cache_dir_name: DEFAULT_CACHE_DIR_NAME.to_string(),
            fingerprint_mode: FingerprintMode::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheStats {
    pub cache_dir: PathBuf,
    pub cached_files: usize,
    pub cached_records: usize,
    pub sessions: usize,
    pub index_entries: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Cache for one project directory, scoped to a single scan.
#[derive(Debug)]
pub struct CacheStore {
    project_dir: PathBuf,
    cache_dir: PathBuf,
    options: CacheOptions,
    index: ProjectIndex,
    diagnostics: Diagnostics,
}

impl CacheStore {
    /// Open (or start) the store. A corrupt or outdated index is discarded, not reported as an error.
    pub fn open(project_dir: &Path, options: CacheOptions) -> Result<Self, CacheError> {
        let cache_dir = project_dir.join(&options.cache_dir_name);
        let files_dir = cache_dir.join(FILES_DIR);
        fs::create_dir_all(&files_dir).map_err(|err| CacheError::io(&files_dir, err))?;

        let mut store = Self {
            project_dir: project_dir.to_path_buf(),
            cache_dir,
            options,
            index: ProjectIndex::empty(project_dir),
            diagnostics: Diagnostics::default(),
        };

        let index_path = store.index_path();
        match read_versioned::<ProjectIndex>(&index_path) {
            Ok(index) => store.index = index,
            Err(CacheError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {}
            Err(CacheError::VersionMismatch { found, expected }) => {
                debug!(path = %index_path.display(), found, expected, "discarding cache index from another format version");
            }
            Err(err) => {
                warn!(path = %index_path.display(), error = %err, "cache index unreadable, rebuilding");
                store.diagnostics.record(DiagnosticKind::CacheCorruption);
            }
        }
        Ok(store)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn index(&self) -> &ProjectIndex {
        &self.index
    }

    pub fn timestamp_index(&self) -> &TimestampIndex {
        &self.index.timestamp_index
    }

    pub fn fingerprint(&self, file: &Path) -> io::Result<Fingerprint> {
        Fingerprint::compute(file, self.options.fingerprint_mode)
    }

    /// Compare the file's current fingerprint with its cache record.
    pub fn validate(&mut self, file: &Path) -> io::Result<CacheStatus> {
        let fingerprint = self.fingerprint(file)?;
        Ok(self.validate_fingerprint(file, &fingerprint))
    }

    /// Like [`validate`](Self::validate) with an already computed fingerprint.
    ///
    /// When the index lacks a matching entry the per-file record is consulted, so a scan
    /// interrupted before the index was rewritten still reuses the files it finished.
    pub fn validate_fingerprint(&mut self, file: &Path, fingerprint: &Fingerprint) -> CacheStatus {
        let key = file_key(file);
        let record_path = self.record_path(file);
        if let Some(entry) = self.index.files.get(&key)
            && entry.fingerprint == *fingerprint
            && record_path.exists()
        {
            return CacheStatus::Hit;
        }

        match read_versioned::<CacheRecord>(&record_path) {
            Ok(record) if record.fingerprint == *fingerprint => {
                debug!(path = %file.display(), "recovered cache entry from per-file record");
                self.index.files.insert(
                    key,
                    IndexedFile {
                        file_path: file.to_path_buf(),
                        fingerprint: record.fingerprint,
                        metadata: record.metadata,
                    },
                );
                CacheStatus::Hit
            }
            Ok(_) => CacheStatus::Miss(MissReason::Stale),
            Err(CacheError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                CacheStatus::Miss(MissReason::Absent)
            }
            Err(CacheError::VersionMismatch { .. }) => CacheStatus::Miss(MissReason::VersionMismatch),
            Err(err) => {
                warn!(path = %record_path.display(), error = %err, "cache record unreadable, reparsing");
                self.diagnostics.record(DiagnosticKind::CacheCorruption);
                CacheStatus::Miss(MissReason::Corrupt)
            }
        }
    }

    /// Metadata stored for `file`. Only meaningful after a hit.
    pub fn load(&self, file: &Path) -> Result<FileMetadata, CacheError> {
        self.index
            .files
            .get(&file_key(file))
            .map(|entry| entry.metadata.clone())
            .ok_or_else(|| CacheError::Stale(file.to_path_buf()))
    }

    /// Records stored for `file`, checked again against `fingerprint`.
    pub fn load_records(
        &mut self,
        file: &Path,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<Record>, CacheError> {
        let record_path = self.record_path(file);
        match read_versioned::<CacheRecord>(&record_path) {
            Ok(record) if record.fingerprint == *fingerprint => Ok(record.records),
            Ok(_) => Err(CacheError::Stale(file.to_path_buf())),
            Err(err) => {
                if matches!(err, CacheError::Json { .. }) {
                    self.diagnostics.record(DiagnosticKind::CacheCorruption);
                }
                Err(err)
            }
        }
    }

    /// Write the file's cache record atomically while holding its lock.
    ///
    /// `fingerprint` must be taken before the file was read, so a file that grows during
    /// parsing is seen as stale on the next run.
    pub fn store(
        &mut self,
        file: &Path,
        fingerprint: &Fingerprint,
        metadata: &FileMetadata,
        records: &[Record],
    ) -> Result<(), CacheError> {
        let record_path = self.record_path(file);
        let _lock = acquire_lock(&lock_path_for(&record_path), self.options.lock_timeout)?;

        let record = CacheRecord {
            format_version: CACHE_FORMAT_VERSION,
            file_path: file.to_path_buf(),
            fingerprint: fingerprint.clone(),
            cached_at: Utc::now(),
            metadata: metadata.clone(),
            records: records.to_vec(),
        };
        write_json_atomic(&record_path, &record)?;

        self.index.files.insert(
            file_key(file),
            IndexedFile {
                file_path: file.to_path_buf(),
                fingerprint: fingerprint.clone(),
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }

    /// Recompute the timestamp index from the entries of `live_files` and persist the index.
    /// Entries for files no longer present are dropped.
    pub fn rebuild_index(&mut self, live_files: &[PathBuf]) -> Result<(), CacheError> {
        let live: BTreeSet<String> = live_files.iter().map(|path| file_key(path)).collect();
        self.index.files.retain(|key, _| live.contains(key));
        self.index.timestamp_index =
            TimestampIndex::from_metadata(self.index.files.values().map(|entry| &entry.metadata));
        self.index.updated_at = Utc::now();
        self.index.format_version = CACHE_FORMAT_VERSION;
        self.index.project_path = self.project_dir.clone();

        let _lock = acquire_lock(&self.cache_dir.join(INDEX_LOCK_FILE), self.options.lock_timeout)?;
        write_json_atomic(&self.index_path(), &self.index)
    }

    /// Files whose cache record is missing or stale. Unreadable files count as modified.
    pub fn modified_files(&mut self, files: &[PathBuf]) -> Vec<PathBuf> {
        files
            .iter()
            .filter(|file| !matches!(self.validate(file), Ok(CacheStatus::Hit)))
            .cloned()
            .collect()
    }

    /// Remove every cache record and the index. Returns how many files were deleted.
    pub fn clear(&mut self) -> Result<usize, CacheError> {
        let mut removed = 0;
        for dir in [self.cache_dir.join(FILES_DIR), self.cache_dir.clone()] {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(CacheError::io(&dir, err)),
            };
            for entry in entries.filter_map(std::result::Result::ok) {
                let path = entry.path();
                let is_cache_file = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext == "json" || ext == "lock");
                if !path.is_file() || !is_cache_file {
                    continue;
                }
                fs::remove_file(&path).map_err(|err| CacheError::io(&path, err))?;
                removed += 1;
            }
        }
        self.index = ProjectIndex::empty(&self.project_dir);
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        let files = self.index.files.values();
        CacheStats {
            cache_dir: self.cache_dir.clone(),
            cached_files: self.index.files.len(),
            cached_records: files.clone().map(|entry| entry.metadata.record_count).sum(),
            sessions: files
                .flat_map(|entry| entry.metadata.sessions.keys())
                .collect::<BTreeSet<_>>()
                .len(),
            index_entries: self.index.timestamp_index.len(),
            created_at: self.index.created_at,
            updated_at: self.index.updated_at,
        }
    }

    /// Problems the store met and recovered from.
    pub fn take_diagnostics(&mut self) -> Diagnostics {
        std::mem::take(&mut self.diagnostics)
    }

    fn index_path(&self) -> PathBuf {
        self.cache_dir.join(INDEX_FILE)
    }

    fn record_path(&self, file: &Path) -> PathBuf {
        self.cache_dir
            .join(FILES_DIR)
            .join(format!("{}.json", file_key(file)))
    }
}

struct CacheLock {
    file: File,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn acquire_lock(path: &Path, timeout: Duration) -> Result<CacheLock, CacheError> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|err| CacheError::io(path, err))?;

    let deadline = Instant::now() + timeout;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(CacheLock { file }),
            Err(_) if Instant::now() < deadline => thread::sleep(LOCK_RETRY_INTERVAL),
            Err(_) => return Err(CacheError::LockTimeout(path.to_path_buf())),
        }
    }
}

fn lock_path_for(record_path: &Path) -> PathBuf {
    record_path.with_extension("lock")
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), CacheError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(|err| CacheError::io(dir, err))?;
    {
        let mut writer = BufWriter::new(&mut tmp);
        serde_json::to_writer(&mut writer, value).map_err(|err| CacheError::json(path, err))?;
        writer.flush().map_err(|err| CacheError::io(path, err))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|err| CacheError::io(path, err))?;
    tmp.persist(path)
        .map_err(|err| CacheError::io(path, err.error))?;
    Ok(())
}

/// Read a JSON document that starts with a `format_version`, rejecting other versions.
fn read_versioned<T: DeserializeOwned>(path: &Path) -> Result<T, CacheError> {
    let raw = fs::read(path).map_err(|err| CacheError::io(path, err))?;
    let probe: VersionProbe =
        serde_json::from_slice(&raw).map_err(|err| CacheError::json(path, err))?;
    if probe.format_version != CACHE_FORMAT_VERSION {
        return Err(CacheError::VersionMismatch {
            found: probe.format_version,
            expected: CACHE_FORMAT_VERSION,
        });
    }
    serde_json::from_slice(&raw).map_err(|err| CacheError::json(path, err))
}

fn file_key(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}
