//! Error types for the indexer

use thiserror::Error;

/// Indexer errors
#[derive(Error, Debug)]
pub enum IndexerError {
    /// Error from strata-db-core
    #[error("core error: {0}")]
    Core(#[from] strata_db_core::Error),

    /// Error from strata-db-novelty
    #[error("novelty error: {0}")]
    Novelty(#[from] strata_db_novelty::NoveltyError),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Storage write error
    #[error("storage write error: {0}")]
    StorageWrite(String),

    /// Storage read error
    #[error("storage read error: {0}")]
    StorageRead(String),
}

impl From<serde_json::Error> for IndexerError {
    fn from(e: serde_json::Error) -> Self {
        IndexerError::Serialization(e.to_string())
    }
}

/// Result type for indexer operations
pub type Result<T> = std::result::Result<T, IndexerError>;
