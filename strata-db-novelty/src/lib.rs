//! Novelty overlay for Strata DB.
//!
//! In-memory storage for committed-but-unindexed transactions that
//! overlays the persisted index trees. Flakes live once in a central
//! arena; each of the 5 orderings keeps a sorted vector of arena ids.
//!
//! # Design
//!
//! - **Arena storage**: flakes stored once, referenced by `FlakeId`
//! - **Per-index sorted vectors**: one id vector per ordering, kept
//!   sorted under that ordering's comparator
//! - **Batch commit**: epoch bumps once per commit, not per flake
//! - **LSM-style merge**: sort the batch, then linear merge with the
//!   existing vector
//!
//! # Example
//!
//! ```ignore
//! use strata_db_novelty::{Commit, Novelty};
//!
//! let mut novelty = Novelty::new(0);
//! novelty.apply_commit(commit)?;
//!
//! // Slice for a leaf's window
//! let slice = novelty.slice_for_range(IndexType::Spot, Some(&first), Some(&rhs), false);
//! ```

mod commit;
mod error;

pub use commit::Commit;
pub use error::{NoveltyError, Result};

use std::cmp::Ordering;
use strata_db_core::{size_flakes_estimate, Flake, IndexType, OverlayProvider};

/// Index into the flake arena. u32 limits the overlay to ~4B flakes.
pub type FlakeId = u32;

/// Maximum FlakeId before overflow.
pub const MAX_FLAKE_ID: u32 = u32::MAX - 1;

/// Default overlay byte budget before commits are refused.
pub const DEFAULT_MAX_BYTES: usize = 64 * 1024 * 1024;

/// Arena-style storage for flakes.
///
/// Flakes are stored once and referenced by `FlakeId` across all 5
/// index vectors.
#[derive(Default, Clone)]
pub struct FlakeStore {
    flakes: Vec<Flake>,
    /// Per-flake estimated size, kept so clears can subtract exactly
    /// what applies added.
    sizes: Vec<usize>,
}

impl FlakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: FlakeId) -> &Flake {
        &self.flakes[id as usize]
    }

    pub fn len(&self) -> usize {
        self.flakes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flakes.is_empty()
    }

    fn push_with_size(&mut self, flake: Flake, size: usize) -> FlakeId {
        let id = self.flakes.len() as FlakeId;
        self.sizes.push(size);
        self.flakes.push(flake);
        id
    }

    fn size(&self, id: FlakeId) -> usize {
        self.sizes[id as usize]
    }
}

/// One sorted id vector per ordering.
#[derive(Clone, Default)]
struct IndexVectors {
    spot: Vec<FlakeId>,
    psot: Vec<FlakeId>,
    post: Vec<FlakeId>,
    opst: Vec<FlakeId>,
    tspo: Vec<FlakeId>,
}

impl IndexVectors {
    fn get_index(&self, index: IndexType) -> &[FlakeId] {
        match index {
            IndexType::Spot => &self.spot,
            IndexType::Psot => &self.psot,
            IndexType::Post => &self.post,
            IndexType::Opst => &self.opst,
            IndexType::Tspo => &self.tspo,
        }
    }

    /// Slice of flake ids inside a leaf's window (binary search).
    ///
    /// Window semantics match index nodes: left edge exclusive unless
    /// leftmost, `rhs` inclusive when present.
    fn slice_for_range(
        &self,
        store: &FlakeStore,
        index: IndexType,
        first: Option<&Flake>,
        rhs: Option<&Flake>,
        leftmost: bool,
    ) -> &[FlakeId] {
        let ids = self.get_index(index);

        if ids.is_empty() {
            return &[];
        }

        let start = if leftmost {
            0
        } else if let Some(f) = first {
            ids.partition_point(|&id| index.compare(store.get(id), f) != Ordering::Greater)
        } else {
            0
        };

        let end = if let Some(r) = rhs {
            ids.partition_point(|&id| index.compare(store.get(id), r) != Ordering::Greater)
        } else {
            ids.len()
        };

        if start >= end {
            return &[];
        }

        &ids[start..end]
    }

    fn retain_alive(&mut self, alive: &[bool]) {
        self.spot.retain(|&id| alive[id as usize]);
        self.psot.retain(|&id| alive[id as usize]);
        self.post.retain(|&id| alive[id as usize]);
        self.opst.retain(|&id| alive[id as usize]);
        self.tspo.retain(|&id| alive[id as usize]);
    }
}

/// Novelty overlay: in-memory storage for unindexed commits.
///
/// Commits are applied atomically; rejections leave the overlay
/// untouched. Applied flakes become visible to queries through the
/// `OverlayProvider` implementation.
#[derive(Clone)]
pub struct Novelty {
    /// Canonical flake storage (arena).
    store: FlakeStore,
    /// Sorted id vectors, one per ordering.
    indexes: IndexVectors,
    /// Total estimated bytes held, for backpressure.
    pub size: usize,
    /// Byte budget; commits that would exceed it are refused.
    pub max_bytes: usize,
    /// Latest transaction time in the overlay.
    pub t: i64,
    /// Epoch for cache invalidation, bumped once per accepted commit
    /// and once per clear.
    pub epoch: u64,
}

impl Novelty {
    /// Create an empty overlay whose horizon starts at `t` (the
    /// transaction time the persisted index covers).
    pub fn new(t: i64) -> Self {
        Self {
            store: FlakeStore::new(),
            indexes: IndexVectors::default(),
            size: 0,
            max_bytes: DEFAULT_MAX_BYTES,
            t,
            epoch: 0,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Apply one commit.
    ///
    /// Rejected commits leave the overlay unchanged:
    /// - empty commits
    /// - commits whose `t` does not advance past the overlay's latest t
    /// - commits that would exceed the byte budget
    ///
    /// The epoch bumps ONCE per accepted commit.
    pub fn apply_commit(&mut self, commit: Commit) -> Result<()> {
        if commit.is_empty() {
            return Err(NoveltyError::empty_commit(format!(
                "commit at t={} carries no flakes",
                commit.t
            )));
        }
        if commit.t <= self.t {
            return Err(NoveltyError::non_increasing_t(format!(
                "commit t={} must exceed overlay t={}",
                commit.t, self.t
            )));
        }

        let commit_t = commit.t;
        let flakes = commit.into_flakes();

        let span = tracing::debug_span!(
            "novelty_apply_commit",
            commit_t = commit_t,
            flake_count = flakes.len(),
        );
        let _guard = span.enter();

        let new_count = self.store.len() + flakes.len();
        if new_count > MAX_FLAKE_ID as usize {
            return Err(NoveltyError::overflow(
                "FlakeId overflow: too many flakes in novelty, trigger reindex",
            ));
        }

        // Budget check before any mutation, so refusal is side-effect free.
        let batch_bytes = size_flakes_estimate(&flakes) as usize;
        if self.size + batch_bytes > self.max_bytes {
            return Err(NoveltyError::novelty_full(format!(
                "commit of {} bytes would exceed budget ({} of {} used)",
                batch_bytes, self.size, self.max_bytes
            )));
        }

        self.t = commit_t;
        self.epoch += 1;
        self.size += batch_bytes;

        let mut batch_ids = Vec::with_capacity(flakes.len());
        for flake in flakes {
            let size = flake.size_estimate_bytes() as usize;
            batch_ids.push(self.store.push_with_size(flake, size));
        }

        // Merge the batch into all 5 vectors in parallel. The store is
        // read-only here; each task owns a disjoint vector.
        let store = &self.store;
        let batch = &batch_ids;
        let IndexVectors {
            spot,
            psot,
            post,
            opst,
            tspo,
        } = &mut self.indexes;

        rayon::scope(|scope| {
            scope.spawn(move |_| merge_batch_into_index(store, spot, batch, IndexType::Spot));
            scope.spawn(move |_| merge_batch_into_index(store, psot, batch, IndexType::Psot));
            scope.spawn(move |_| merge_batch_into_index(store, post, batch, IndexType::Post));
            scope.spawn(move |_| merge_batch_into_index(store, opst, batch, IndexType::Opst));
            scope.spawn(move |_| merge_batch_into_index(store, tspo, batch, IndexType::Tspo));
        });

        Ok(())
    }

    /// Drop flakes with `t <= cutoff_t` after an index rebuild absorbed
    /// them. Uses a bitmap rather than a set for a cache-friendly O(n)
    /// pass.
    ///
    /// `cutoff_t` beyond the overlay's latest t is refused: it would
    /// claim the index covers transactions the overlay has not seen.
    pub fn clear_up_to(&mut self, cutoff_t: i64) -> Result<()> {
        if cutoff_t > self.t {
            return Err(NoveltyError::beyond_horizon(format!(
                "cutoff t={} exceeds overlay t={}",
                cutoff_t, self.t
            )));
        }

        let n = self.store.len();
        if n == 0 {
            return Ok(());
        }

        let mut alive = vec![false; n];
        let mut new_size = 0usize;

        for (i, is_alive) in alive.iter_mut().enumerate() {
            let flake = self.store.get(i as FlakeId);
            if flake.t > cutoff_t {
                *is_alive = true;
                new_size += self.store.size(i as FlakeId);
            }
        }

        self.indexes.retain_alive(&alive);
        self.size = new_size;
        self.epoch += 1;

        Ok(())
    }

    /// Ids inside a leaf's window under one ordering.
    pub fn slice_for_range(
        &self,
        index: IndexType,
        first: Option<&Flake>,
        rhs: Option<&Flake>,
        leftmost: bool,
    ) -> &[FlakeId] {
        self.indexes
            .slice_for_range(&self.store, index, first, rhs, leftmost)
    }

    pub fn get_flake(&self, id: FlakeId) -> &Flake {
        self.store.get(id)
    }

    /// Number of flake slots in the arena, cleared ones included. The
    /// live count is what `iter_index` yields.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Iterate live flake ids for one ordering.
    pub fn iter_index(&self, index: IndexType) -> impl Iterator<Item = FlakeId> + '_ {
        self.indexes.get_index(index).iter().copied()
    }
}

impl std::fmt::Debug for Novelty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Novelty")
            .field("flake_count", &self.store.len())
            .field("size", &self.size)
            .field("t", &self.t)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl OverlayProvider for Novelty {
    fn epoch(&self) -> u64 {
        self.epoch
    }

    fn for_each_overlay_flake(
        &self,
        index: IndexType,
        first: Option<&Flake>,
        rhs: Option<&Flake>,
        leftmost: bool,
        to_t: i64,
        callback: &mut dyn FnMut(&Flake),
    ) {
        let slice = self.slice_for_range(index, first, rhs, leftmost);

        for &id in slice {
            let flake = self.get_flake(id);
            if flake.t <= to_t {
                callback(flake);
            }
        }
    }
}

/// LSM-style merge: sort the batch under the index comparator, then
/// two-way merge with the existing sorted vector.
fn merge_batch_into_index(
    store: &FlakeStore,
    target: &mut Vec<FlakeId>,
    batch_ids: &[FlakeId],
    index: IndexType,
) {
    use rayon::prelude::*;

    let mut sorted_batch = batch_ids.to_vec();
    sorted_batch.par_sort_unstable_by(|&a, &b| index.compare(store.get(a), store.get(b)));

    let mut merged = Vec::with_capacity(target.len() + sorted_batch.len());
    let mut i = 0;
    let mut j = 0;

    while i < target.len() && j < sorted_batch.len() {
        let cmp = index.compare(store.get(target[i]), store.get(sorted_batch[j]));
        if cmp != Ordering::Greater {
            merged.push(target[i]);
            i += 1;
        } else {
            merged.push(sorted_batch[j]);
            j += 1;
        }
    }
    merged.extend_from_slice(&target[i..]);
    merged.extend_from_slice(&sorted_batch[j..]);

    *target = merged;
}
