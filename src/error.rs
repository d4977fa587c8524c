//! Error types shared by the store, scoring, backend and evaluation layers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScoringError>;

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed profile '{profile}': {reason}")]
    MalformedProfile { profile: String, reason: String },

    #[error("stratification '{scheme}' rejected: {reason}")]
    MalformedStratification { scheme: String, reason: String },

    #[error("insufficient overlap: {shared} shared genes, at least {required} required")]
    InsufficientOverlap { shared: usize, required: usize },

    #[error("statistic undefined: {0}")]
    UndefinedStatistic(String),

    #[error("gene set backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("gene set backend '{backend}' failed: {reason}")]
    BackendFailed { backend: String, reason: String },

    #[error("gene set backend '{backend}' exceeded {budget_secs:.1}s budget")]
    ComputationTimeout { backend: String, budget_secs: f64 },

    #[error("degenerate label set for {context}: {reason}")]
    DegenerateLabelSet { context: String, reason: String },

    #[error("evaluation step {to} not valid after {from}")]
    InvalidTransition { from: String, to: String },

    #[error("run cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used in failure reports, so that a broken tool can
/// be told apart from data that cannot support a statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Input,
    Statistical,
    Backend,
    Cancelled,
    Internal,
}

impl ScoringError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScoringError::NotFound(_)
            | ScoringError::MalformedProfile { .. }
            | ScoringError::MalformedStratification { .. }
            | ScoringError::Config(_) => ErrorKind::Input,
            ScoringError::InsufficientOverlap { .. }
            | ScoringError::UndefinedStatistic(_)
            | ScoringError::DegenerateLabelSet { .. } => ErrorKind::Statistical,
            ScoringError::BackendUnavailable { .. }
            | ScoringError::BackendFailed { .. }
            | ScoringError::ComputationTimeout { .. } => ErrorKind::Backend,
            ScoringError::Cancelled => ErrorKind::Cancelled,
            ScoringError::InvalidTransition { .. } | ScoringError::Io(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn malformed(profile: &str, reason: impl Into<String>) -> Self {
        ScoringError::MalformedProfile {
            profile: profile.to_string(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Input => "input",
            ErrorKind::Statistical => "statistical",
            ErrorKind::Backend => "backend",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}
