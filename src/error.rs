//! Error types for the trainer, clusterer and persistence layer.
//!
//! Edge cases the search path must absorb (missing model file, a query with no
//! known lemmas, a cluster that empties out) are not represented here: they are
//! recovered where they happen. What remains is fatal for the current run.

use std::path::PathBuf;
use thiserror::Error;

use crate::train::TrainStage;

/// Failures while reading or writing persisted state.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to access '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The file exists but does not describe a consistent state.
    #[error("malformed persisted state in '{path}': {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("failed to encode or decode '{path}': {reason}")]
    Codec { path: PathBuf, reason: String },
}

impl PersistError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PersistError::Io { path: path.into(), source }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        PersistError::Malformed { path: path.into(), reason: reason.to_string() }
    }

    pub(crate) fn codec(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        PersistError::Codec { path: path.into(), reason: reason.to_string() }
    }
}

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("trainer is in stage {found:?}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        found: TrainStage,
    },

    #[error("corpus produced an empty vocabulary")]
    EmptyCorpus,

    #[error("vector for '{word}' has {actual} dimensions, expected {expected}")]
    DimensionMismatch {
        word: String,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("no vectors were given to cluster")]
    EmptyInput,

    #[error("invalid cluster count {k} for {n} vectors")]
    InvalidClusterCount { k: usize, n: usize },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("usage: {0}")]
    Usage(String),

    #[error("cannot read config '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top level error returned by the pipeline and the query binary.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Train(#[from] TrainError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, Error>;
