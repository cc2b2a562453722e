//! Stage identity and failure classification.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The four pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Enrich,
    Summarize,
    Document,
    Notify,
}

impl StageKind {
    /// All stages in the order the orchestrator runs them.
    pub const ORDERED: [StageKind; 4] = [
        StageKind::Enrich,
        StageKind::Summarize,
        StageKind::Document,
        StageKind::Notify,
    ];

    /// Stable lowercase name, used in logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Enrich => "enrich",
            StageKind::Summarize => "summarize",
            StageKind::Document => "document",
            StageKind::Notify => "notify",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A classified stage failure.
///
/// The classification decides retry behavior: transient failures are retried
/// per policy, permanent failures abandon the item immediately.
#[derive(Debug, Error)]
pub enum StageError {
    /// Worth retrying: timeouts, rate limits, upstream 5xx, connection loss.
    #[error("transient: {0}")]
    Transient(#[source] anyhow::Error),

    /// Retrying cannot help: bad input, missing data, rejected content.
    #[error("permanent: {0}")]
    Permanent(#[source] anyhow::Error),
}

impl StageError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        StageError::Transient(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        StageError::Permanent(err.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StageError::Transient(_))
    }

    /// Classification label used in logs and metrics.
    pub fn class(&self) -> &'static str {
        match self {
            StageError::Transient(_) => "transient",
            StageError::Permanent(_) => "permanent",
        }
    }

    /// The full cause chain, for failure records and logs.
    pub fn detail(&self) -> String {
        match self {
            StageError::Transient(e) | StageError::Permanent(e) => format!("{e:#}"),
        }
    }
}

/// Outcome of a single stage attempt.
pub type StageResult<T> = Result<T, StageError>;
