//! Ledger state combining an indexed Db with the novelty overlay
//!
//! This crate provides [`LedgerState`], which combines:
//! - A persisted [`Db`] (the latest indexed state)
//! - A [`Novelty`] overlay (committed transactions since the last index)
//!
//! Together they give a consistent view of the database at any
//! transaction time, before and after index rebuilds.
//!
//! # Example
//!
//! ```ignore
//! use strata_db_ledger::{IndexConfig, LedgerState};
//!
//! let mut ledger = LedgerState::genesis(storage, cache, "mydb:main");
//! ledger.merge_commit(commit)?;
//!
//! if ledger.needs_reindex(&IndexConfig::default()) {
//!     let result = ledger.reindex(&indexer_config).await?;
//!     ledger.apply_index(&result).await?;
//! }
//!
//! // Time travel: results as of t=5
//! let view = ledger.view_at(5)?;
//! let flakes = view.range(IndexType::Spot, test, match_val, opts).await?;
//! ```

mod error;

pub use error::{LedgerError, Result};

use std::sync::Arc;
use strata_db_core::{
    range_with_overlay, Db, Flake, IndexType, NodeCache, RangeMatch, RangeOptions, RangeTest,
    Storage,
};
use strata_db_indexer::{reindex, IndexResult, IndexerConfig};
use strata_db_novelty::{Commit, Novelty};

/// Thresholds for novelty backpressure
#[derive(Clone, Debug)]
pub struct IndexConfig {
    /// Soft threshold: trigger background indexing (default 100KB)
    pub reindex_min_bytes: usize,
    /// Hard threshold: block new commits until indexed (default 1MB)
    pub reindex_max_bytes: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            reindex_min_bytes: 100_000,
            reindex_max_bytes: 1_000_000,
        }
    }
}

/// Ledger state: the persisted index plus in-memory novelty
#[derive(Debug, Clone)]
pub struct LedgerState<S, C> {
    /// The indexed database
    pub db: Db<S, C>,
    /// Overlay of transactions committed since the last index build
    pub novelty: Arc<Novelty>,
    /// Address of the current root record, absent for genesis ledgers.
    pub root_address: Option<String>,
}

impl<S, C> LedgerState<S, C>
where
    S: Storage + Clone,
    C: NodeCache + Clone,
{
    /// Create a ledger state from components
    pub fn new(db: Db<S, C>, novelty: Novelty) -> Self {
        Self {
            db,
            novelty: Arc::new(novelty),
            root_address: None,
        }
    }

    /// Create a brand-new ledger with nothing indexed and nothing
    /// committed.
    pub fn genesis(storage: S, cache: C, alias: &str) -> Self {
        let db = Db::genesis(storage, cache, alias);
        let novelty = Novelty::new(db.t);
        Self::new(db, novelty)
    }

    /// Load a ledger from a persisted root record, with an empty overlay.
    pub async fn load(storage: S, cache: C, root_address: &str) -> Result<Self> {
        let db = Db::load(storage, cache, root_address).await?;
        let novelty = Novelty::new(db.t);
        Ok(Self {
            root_address: Some(root_address.to_string()),
            novelty: Arc::new(novelty),
            db,
        })
    }

    /// Current transaction time (max of index and novelty)
    pub fn t(&self) -> i64 {
        self.novelty.t.max(self.db.t)
    }

    /// Transaction time the persisted index covers
    pub fn index_t(&self) -> i64 {
        self.db.t
    }

    pub fn alias(&self) -> &str {
        &self.db.alias
    }

    pub fn novelty_size(&self) -> usize {
        self.novelty.size
    }

    pub fn epoch(&self) -> u64 {
        self.novelty.epoch
    }

    /// Has novelty grown enough that a background reindex is worthwhile?
    pub fn needs_reindex(&self, config: &IndexConfig) -> bool {
        self.novelty.size >= config.reindex_min_bytes
    }

    /// Has novelty grown enough that commits should block until indexed?
    pub fn must_reindex(&self, config: &IndexConfig) -> bool {
        self.novelty.size >= config.reindex_max_bytes
    }

    /// Apply one commit to the overlay.
    ///
    /// Surfaces the overlay's own rejections unchanged: empty commits,
    /// non-increasing t, and byte backpressure.
    pub fn merge_commit(&mut self, commit: Commit) -> Result<()> {
        Arc::make_mut(&mut self.novelty).apply_commit(commit)?;
        Ok(())
    }

    /// Rebuild all 5 orderings from the current state.
    ///
    /// The returned result is not applied; call [`apply_index`] to adopt
    /// it. Keeping the steps separate lets a background task rebuild
    /// while commits continue against this state.
    ///
    /// [`apply_index`]: LedgerState::apply_index
    pub async fn reindex(&self, config: &IndexerConfig) -> Result<IndexResult> {
        let result = reindex(
            &self.db,
            self.novelty.as_ref(),
            config,
            self.root_address.clone(),
        )
        .await?;
        Ok(result)
    }

    /// Adopt a completed index build: load the new Db and trim novelty
    /// up to the time the index covers.
    ///
    /// Commits applied after the rebuild started stay in novelty, since
    /// their t exceeds `index_t`.
    pub async fn apply_index(&mut self, result: &IndexResult) -> Result<()> {
        if result.index_t <= self.db.t {
            return Err(LedgerError::stale_index(result.index_t, self.db.t));
        }

        let new_db = Db::load(
            self.db.storage.clone(),
            self.db.cache.clone(),
            &result.root_address,
        )
        .await?;

        Arc::make_mut(&mut self.novelty).clear_up_to(result.index_t)?;
        self.db = new_db;
        self.root_address = Some(result.root_address.clone());

        tracing::info!(
            alias = %self.db.alias,
            index_t = result.index_t,
            novelty_bytes = self.novelty.size,
            "applied new index"
        );
        Ok(())
    }

    /// Range query over index plus novelty at the ledger head.
    pub async fn range(
        &self,
        index: IndexType,
        test: RangeTest,
        match_val: RangeMatch,
        opts: RangeOptions,
    ) -> Result<Vec<Flake>> {
        // Head time includes novelty past the indexed t.
        let opts = if opts.to_t.is_none() {
            opts.with_to_t(self.t())
        } else {
            opts
        };
        let flakes = range_with_overlay(
            &self.db,
            self.novelty.as_ref(),
            index,
            test,
            match_val,
            opts,
        )
        .await?;
        Ok(flakes)
    }

    /// Read-only view of the ledger as of transaction time `t`.
    pub fn view_at(&self, t: i64) -> Result<LedgerView<'_, S, C>> {
        let head = self.t();
        if t > head {
            return Err(LedgerError::future_time(t, head));
        }
        Ok(LedgerView { ledger: self, t })
    }
}

/// Read-only time-travel view at a fixed transaction time.
///
/// Every query forces `to_t` to the view's time, so results are the
/// facts visible then, whether they now live in the index or the
/// overlay.
#[derive(Debug)]
pub struct LedgerView<'a, S, C> {
    ledger: &'a LedgerState<S, C>,
    t: i64,
}

impl<S, C> LedgerView<'_, S, C>
where
    S: Storage + Clone,
    C: NodeCache + Clone,
{
    pub fn to_t(&self) -> i64 {
        self.t
    }

    pub async fn range(
        &self,
        index: IndexType,
        test: RangeTest,
        match_val: RangeMatch,
        opts: RangeOptions,
    ) -> Result<Vec<Flake>> {
        let opts = opts.with_to_t(self.t);
        let flakes = range_with_overlay(
            &self.ledger.db,
            self.ledger.novelty.as_ref(),
            index,
            test,
            match_val,
            opts,
        )
        .await?;
        Ok(flakes)
    }
}
