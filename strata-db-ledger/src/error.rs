//! Error types for ledger state management

use thiserror::Error;

/// Ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Error from strata-db-core
    #[error("core error: {0}")]
    Core(#[from] strata_db_core::Error),

    /// Error from strata-db-novelty
    #[error("novelty error: {0}")]
    Novelty(#[from] strata_db_novelty::NoveltyError),

    /// Error from strata-db-indexer
    #[error("indexer error: {0}")]
    Indexer(#[from] strata_db_indexer::IndexerError),

    /// A new index is not newer than the current one
    #[error("stale index: index_t {index_t} does not advance current index_t {current_t}")]
    StaleIndex { index_t: i64, current_t: i64 },

    /// Requested a view at a time past the ledger head
    #[error("future time: t {target_t} is past ledger head t {head_t}")]
    FutureTime { target_t: i64, head_t: i64 },
}

impl LedgerError {
    pub fn stale_index(index_t: i64, current_t: i64) -> Self {
        LedgerError::StaleIndex { index_t, current_t }
    }

    pub fn future_time(target_t: i64, head_t: i64) -> Self {
        LedgerError::FutureTime { target_t, head_t }
    }
}

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;
