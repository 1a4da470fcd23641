//! Error taxonomy for the imperfection pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used by every library-level operation.
pub type Result<T> = std::result::Result<T, ImperfectionError>;

#[derive(Debug, Error)]
pub enum ImperfectionError {
    /// Input text file could not be parsed (bad token, inconsistent columns).
    #[error("malformed file {}: line {line}: {reason}", path.display())]
    MalformedFile {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// Too few samples for the requested operation.
    #[error("insufficient data for {operation}: need at least {needed} points, got {got}")]
    InsufficientData {
        operation: &'static str,
        needed: usize,
        got: usize,
    },

    /// Degenerate or near-singular fit geometry.
    #[error("ill-conditioned fit: {0}")]
    IllConditionedFit(String),

    /// Iterative fit ran out of iterations before reaching its tolerance.
    #[error("fit did not converge after {iterations} iterations (rms residual {rms:.3e})")]
    Convergence { iterations: usize, rms: f64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Config(#[from] toml::de::Error),
}

impl ImperfectionError {
    pub fn malformed(path: impl Into<PathBuf>, line: usize, reason: impl Into<String>) -> Self {
        Self::MalformedFile {
            path: path.into(),
            line,
            reason: reason.into(),
        }
    }

    pub fn insufficient(operation: &'static str, needed: usize, got: usize) -> Self {
        Self::InsufficientData {
            operation,
            needed,
            got,
        }
    }

    pub fn ill_conditioned(details: impl Into<String>) -> Self {
        Self::IllConditionedFit(details.into())
    }

    pub fn invalid_config(details: impl Into<String>) -> Self {
        Self::InvalidConfig(details.into())
    }
}
