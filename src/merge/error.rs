use thiserror::Error;

use crate::part::PartError;

/// Errors that can surface while executing a part merge.
#[derive(Debug, Error)]
pub enum MergeError {
    /// A cancellation token fired; the partial output directory is left for
    /// the caller to remove.
    #[error("{0}")]
    Aborted(&'static str),
    /// Internal invariant violated; indicates a bug.
    #[error("logical error: {0}")]
    Logical(String),
    /// Unexpected concrete storage encountered on the vector-index path.
    #[error("bad arguments: {0}")]
    BadArguments(String),
    #[error(transparent)]
    Part(#[from] PartError),
    #[error("merge io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("merge payload error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("merge arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),
}

impl MergeError {
    pub(crate) fn aborted() -> Self {
        MergeError::Aborted("cancelled merging parts")
    }

    pub(crate) fn aborted_ttl() -> Self {
        MergeError::Aborted("cancelled merging parts with TTL")
    }
}
