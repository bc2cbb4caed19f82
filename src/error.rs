use std::path::PathBuf;

use thiserror::Error;

/// Why a single transcript line could not become a record.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed JSON: {0}")]
    MalformedJson(#[source] serde_json::Error),
    #[error("unrecognized schema: {0}")]
    UnrecognizedSchema(String),
}

impl ParseError {
    pub fn unrecognized(reason: impl Into<String>) -> Self {
        Self::UnrecognizedSchema(reason.into())
    }
}

/// Date bounds that could not be turned into instants. Never recovered locally.
#[derive(Debug, Error)]
pub enum DateError {
    #[error("could not resolve {bound} date: {phrase:?}")]
    Unresolved { bound: &'static str, phrase: String },
    #[error("from date {from} is after to date {to}")]
    InvertedRange { from: String, to: String },
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid cache JSON at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cache format version {found} does not match {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("cache record for {0} is stale")]
    Stale(PathBuf),
    #[error("timed out waiting for cache lock {0}")]
    LockTimeout(PathBuf),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("project directory not found: {0}")]
    ProjectNotFound(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Date(#[from] DateError),
}
