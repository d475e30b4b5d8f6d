//! Error types for the novelty crate.

use thiserror::Error;

/// Result type for novelty operations.
pub type Result<T> = std::result::Result<T, NoveltyError>;

#[derive(Error, Debug)]
pub enum NoveltyError {
    /// Commit carried no flakes.
    #[error("empty commit: {0}")]
    EmptyCommit(String),

    /// Commit t did not advance past the overlay's latest t.
    #[error("non-increasing commit t: {0}")]
    NonIncreasingT(String),

    /// Overlay byte budget exhausted; a reindex must drain it first.
    #[error("novelty full: {0}")]
    NoveltyFull(String),

    /// Clear cutoff lies beyond the overlay's horizon.
    #[error("cutoff beyond horizon: {0}")]
    BeyondHorizon(String),

    /// FlakeId space exhausted.
    #[error("novelty overflow: {0}")]
    Overflow(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Core error wrapper.
    #[error("core error: {0}")]
    Core(#[from] strata_db_core::Error),
}

impl NoveltyError {
    pub fn empty_commit(msg: impl Into<String>) -> Self {
        Self::EmptyCommit(msg.into())
    }

    pub fn non_increasing_t(msg: impl Into<String>) -> Self {
        Self::NonIncreasingT(msg.into())
    }

    pub fn novelty_full(msg: impl Into<String>) -> Self {
        Self::NoveltyFull(msg.into())
    }

    pub fn beyond_horizon(msg: impl Into<String>) -> Self {
        Self::BeyondHorizon(msg.into())
    }

    pub fn overflow(msg: impl Into<String>) -> Self {
        Self::Overflow(msg.into())
    }
}
