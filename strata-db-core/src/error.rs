//! Error types for strata-db-core.
//!
//! Storage failures are fatal: they propagate to the caller and are never
//! retried inside the engine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Backend read/write failure. Fatal; never retried.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid index: {0}")]
    InvalidIndex(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// A requested view falls outside the data the snapshot can serve.
    #[error("temporal consistency: {0}")]
    TemporalConsistency(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn invalid_address(msg: impl Into<String>) -> Self {
        Error::InvalidAddress(msg.into())
    }

    pub fn invalid_index(msg: impl Into<String>) -> Self {
        Error::InvalidIndex(msg.into())
    }

    pub fn invalid_range(msg: impl Into<String>) -> Self {
        Error::InvalidRange(msg.into())
    }

    pub fn temporal(msg: impl Into<String>) -> Self {
        Error::TemporalConsistency(msg.into())
    }

    pub fn cache(msg: impl Into<String>) -> Self {
        Error::Cache(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Error::Io(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }
}
