//! Error types for virial coefficient runs.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal conditions surfaced by the engine.
///
/// Recoverable conditions (screened samples, degenerate reweighting rounds)
/// never show up here; they are handled locally and at most logged.
#[derive(Error, Debug)]
pub enum VirialError {
    /// The analytic reference integral is unusable, so no ratio can be formed
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// A starting configuration has zero or non-finite sampling weight
    #[error("box {box_index} starts with an invalid configuration: {message}")]
    InvalidConfiguration { box_index: usize, message: String },

    /// Run parameters that fail validation
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Point counts outside what a cluster evaluator supports
    #[error("unsupported number of points {n} for {what} (supported: {supported})")]
    UnsupportedPoints {
        n: usize,
        what: &'static str,
        supported: &'static str,
    },

    /// Filesystem errors while reading or publishing checkpoint files
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed raw-data or weights file
    #[error("{path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// Summary serialisation failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VirialError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        VirialError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, VirialError>;
