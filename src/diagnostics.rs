use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    MalformedJson,
    UnrecognizedSchema,
    SchemaDrift,
    MissingSessionId,
    OrphanSummary,
    CacheCorruption,
    FileAccess,
}

impl DiagnosticKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::MalformedJson => "malformed JSON lines",
            Self::UnrecognizedSchema => "unrecognized schema lines",
            Self::SchemaDrift => "unknown record kinds",
            Self::MissingSessionId => "records without session id",
            Self::OrphanSummary => "orphan summaries",
            Self::CacheCorruption => "corrupt cache records",
            Self::FileAccess => "unreadable source files",
        }
    }
}

impl From<&ParseError> for DiagnosticKind {
    fn from(err: &ParseError) -> Self {
        match err {
            ParseError::MalformedJson(_) => Self::MalformedJson,
            ParseError::UnrecognizedSchema(_) => Self::UnrecognizedSchema,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Per-run tally of every recoverable problem. Output is never interrupted for these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Diagnostics {
    pub counts: BTreeMap<DiagnosticKind, usize>,
    pub file_failures: Vec<FileFailure>,
}

impl Diagnostics {
    pub fn record(&mut self, kind: DiagnosticKind) {
        self.record_many(kind, 1);
    }

    pub fn record_many(&mut self, kind: DiagnosticKind, count: usize) {
        if count == 0 {
            return;
        }
        *self.counts.entry(kind).or_insert(0) += count;
    }

    pub fn record_file_failure(&mut self, path: impl Into<PathBuf>, reason: impl fmt::Display) {
        self.record(DiagnosticKind::FileAccess);
        self.file_failures.push(FileFailure {
            path: path.into(),
            reason: reason.to_string(),
        });
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn merge(&mut self, other: &Diagnostics) {
        for (kind, count) in &other.counts {
            self.record_many(*kind, *count);
        }
        self.file_failures.extend(other.file_failures.iter().cloned());
    }

    pub fn summary_line(&self) -> String {
        if self.is_empty() {
            return "no problems".to_string();
        }
        self.counts
            .iter()
            .map(|(kind, count)| format!("{count} {}", kind.label()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
