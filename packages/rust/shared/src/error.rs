//! Error types for sourcewatch.
//!
//! Library crates use [`SourcewatchError`] via `thiserror`.
//! Per-source fetch outcomes use [`FetchError`], which never aborts a run.
//! The CLI wraps both with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level error type for all sourcewatch operations.
#[derive(Debug, thiserror::Error)]
pub enum SourcewatchError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error outside of a per-source fetch (client setup, audit).
    #[error("network error: {0}")]
    Network(String),

    /// Feed, HTML or JSON parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad registry entry, invalid URL, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Item analysis failed (external analyzer unreachable or malformed reply).
    #[error("analysis error: {0}")]
    Analysis(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SourcewatchError>;

impl SourcewatchError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// FetchError
// ---------------------------------------------------------------------------

/// Broad classification of a source failure, as shown in run reports.
///
/// `Network` and `Parse` are transient for retry and health purposes; the
/// split only matters for reporting. `Store` marks a source whose items could
/// not be checked against the dedup store; it does not count against health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Parse,
    Store,
}

/// Why a single source could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Connection refused, DNS failure, TLS error, body read failure.
    #[error("network error: {0}")]
    Network(String),

    /// The request did not complete within the per-call timeout.
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The server answered with an error status.
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    /// The payload was retrieved but could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// A feed-only source has no feed URL.
    #[error("source '{0}' has no feed URL")]
    MissingFeedUrl(String),

    /// The attempt was still in flight when the run budget ran out.
    #[error("abandoned: run budget exhausted")]
    Abandoned,

    /// Feed attempt failed and the page fallback failed as well.
    #[error("feed: {feed}; page: {page}")]
    Both {
        feed: Box<FetchError>,
        page: Box<FetchError>,
    },
}

impl FetchError {
    /// Classify this failure.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Parse(_) => FailureKind::Parse,
            Self::Both { page, .. } => page.kind(),
            _ => FailureKind::Network,
        }
    }

    /// Map a `reqwest`-style error message, promoting timeouts to [`FetchError::Timeout`].
    pub fn from_transport(message: impl Into<String>, timed_out: bool, secs: u64) -> Self {
        if timed_out {
            Self::Timeout { secs }
        } else {
            Self::Network(message.into())
        }
    }
}
