use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{Record, RecordKind, TokenUsage};
use crate::util::truncate;

pub const DEFAULT_FIRST_MESSAGE_CHARS: usize = 500;

const SYSTEM_MESSAGE_PATTERNS: [&str; 3] = [
    "Caveat: The messages below were generated by the user while running local commands.",
    "[Request interrupted by user for tool use]",
    "<local-command-stdout>",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct KindCounts {
    pub user: usize,
    pub assistant: usize,
    pub system: usize,
    pub other: usize,
}

impl KindCounts {
    fn observe(&mut self, kind: RecordKind) {
        match kind {
            RecordKind::User => self.user += 1,
            RecordKind::Assistant => self.assistant += 1,
            RecordKind::System => self.system += 1,
            RecordKind::Other | RecordKind::Summary => self.other += 1,
        }
    }
}

/// All records sharing one session id, ordered, with derived ranges and totals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub records: Vec<Record>,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub tokens: TokenUsage,
    pub kind_counts: KindCounts,
    pub summary: Option<String>,
    pub first_user_message: Option<String>,
    pub cwd: Option<String>,
    pub source_files: BTreeSet<PathBuf>,
}

impl Session {
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Summary if one was matched, then the first user message, then a short id.
    pub fn display_title(&self) -> String {
        if let Some(summary) = &self.summary {
            return summary.clone();
        }
        if let Some(message) = &self.first_user_message {
            return message.clone();
        }
        self.id.chars().take(8).collect()
    }

    /// Rebuild the session from the records accepted by `keep`. `None` when nothing survives.
    pub fn retain_records<F>(&self, first_message_chars: usize, mut keep: F) -> Option<Session>
    where
        F: FnMut(&Record) -> bool,
    {
        let mut accumulator = SessionAccumulator::new(&self.id);
        for record in self.records.iter().filter(|record| keep(record)) {
            accumulator.apply_record(record.clone());
        }
        if accumulator.is_empty() {
            return None;
        }
        let mut session = accumulator.finish(first_message_chars);
        session.summary = self.summary.clone();
        session.source_files = self.source_files.clone();
        Some(session)
    }

    pub fn metadata(&self) -> SessionMetadata {
        let mut timestamps: Vec<DateTime<Utc>> =
            self.records.iter().filter_map(|record| record.timestamp).collect();
        timestamps.sort();
        timestamps.dedup();
        SessionMetadata {
            id: self.id.clone(),
            first_timestamp: self.first_timestamp,
            last_timestamp: self.last_timestamp,
            record_count: self.records.len(),
            tokens: self.tokens,
            kind_counts: self.kind_counts,
            first_user_message: self.first_user_message.clone(),
            cwd: self.cwd.clone(),
            timestamps,
        }
    }
}

/// What the cache keeps about a session without its records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionMetadata {
    pub id: String,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub record_count: usize,
    pub tokens: TokenUsage,
    pub kind_counts: KindCounts,
    pub first_user_message: Option<String>,
    pub cwd: Option<String>,
    pub timestamps: Vec<DateTime<Utc>>,
}

/// Folds records into a session. Token totals and range are kept up to date per record.
#[derive(Debug, Default)]
pub struct SessionAccumulator {
    id: String,
    records: Vec<Record>,
    first_timestamp: Option<DateTime<Utc>>,
    last_timestamp: Option<DateTime<Utc>>,
    tokens: TokenUsage,
    kind_counts: KindCounts,
    source_files: BTreeSet<PathBuf>,
}

impl SessionAccumulator {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    pub fn apply_record(&mut self, record: Record) {
        if let Some(ts) = record.timestamp {
            self.first_timestamp = min_datetime(self.first_timestamp, Some(ts));
            self.last_timestamp = max_datetime(self.last_timestamp, Some(ts));
        }
        if let Some(usage) = record.usage() {
            self.tokens.add(usage);
        }
        self.kind_counts.observe(record.kind());
        self.records.push(record);
    }

    pub fn add_source(&mut self, path: &Path) {
        self.source_files.insert(path.to_path_buf());
    }

    pub fn tokens(&self) -> &TokenUsage {
        &self.tokens
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Order records by timestamp; the stable sort keeps input order on ties.
    pub fn finish(mut self, first_message_chars: usize) -> Session {
        self.records.sort_by(compare_record_time);
        let first_user_message = self
            .records
            .iter()
            .filter(|record| record.kind() == RecordKind::User)
            .map(Record::text)
            .find(|text| !text.trim().is_empty() && !is_system_message(text))
            .map(|text| truncate(text.trim(), first_message_chars));
        let cwd = self.records.iter().find_map(|record| record.cwd.clone());

        Session {
            id: self.id,
            records: self.records,
            first_timestamp: self.first_timestamp,
            last_timestamp: self.last_timestamp,
            tokens: self.tokens,
            kind_counts: self.kind_counts,
            summary: None,
            first_user_message,
            cwd,
            source_files: self.source_files,
        }
    }
}

/// Group one file's records by session. Summary records are left to the summary matcher.
pub fn assemble_sessions<I>(
    records: I,
    source: Option<&Path>,
    first_message_chars: usize,
) -> BTreeMap<String, Session>
where
    I: IntoIterator<Item = Record>,
{
    let mut accumulators: BTreeMap<String, SessionAccumulator> = BTreeMap::new();
    for record in records {
        if record.kind() == RecordKind::Summary {
            continue;
        }
        let accumulator = accumulators
            .entry(record.session_key().to_string())
            .or_insert_with_key(|key| SessionAccumulator::new(key));
        if let Some(path) = source {
            accumulator.add_source(path);
        }
        accumulator.apply_record(record);
    }
    accumulators
        .into_iter()
        .map(|(id, accumulator)| (id, accumulator.finish(first_message_chars)))
        .collect()
}

/// Timestamped records first in ascending order, untimed records after them.
pub fn compare_record_time(left: &Record, right: &Record) -> Ordering {
    match (left.timestamp, right.timestamp) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

pub fn is_system_message(text: &str) -> bool {
    SYSTEM_MESSAGE_PATTERNS
        .iter()
        .any(|pattern| text.contains(pattern))
}

pub(crate) fn min_datetime(
    left: Option<DateTime<Utc>>,
    right: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (left, right) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

pub(crate) fn max_datetime(
    left: Option<DateTime<Utc>>,
    right: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (left, right) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
