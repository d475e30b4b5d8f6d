//! Overlay provider: extra flakes injected at leaf resolution time.
//!
//! The novelty crate implements this trait so unindexed commits become
//! visible without core depending on novelty types. The API is push-based
//! (a callback per flake) to keep the hot path free of boxed iterators.
//!
//! Boundary semantics match node windows: the left edge `first` is
//! exclusive unless the leaf is leftmost, and `rhs` is inclusive when
//! present. The overlay applies the `to_t` ceiling itself; the resolver
//! applies `from_t` and stale removal afterwards.

use crate::comparator::IndexType;
use crate::flake::Flake;

pub trait OverlayProvider: Send + Sync {
    /// Monotonic counter bumped once per accepted commit.
    ///
    /// Incorporated into materialized-leaf cache keys, so a new commit
    /// invalidates by key without any explicit cache flush.
    fn epoch(&self) -> u64;

    /// Push overlay flakes inside a leaf's window, sorted under `index`'s
    /// comparator, restricted to `flake.t <= to_t`.
    fn for_each_overlay_flake(
        &self,
        index: IndexType,
        first: Option<&Flake>,
        rhs: Option<&Flake>,
        leftmost: bool,
        to_t: i64,
        callback: &mut dyn FnMut(&Flake),
    );
}

/// Null overlay for pure index reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOverlay;

impl OverlayProvider for NoOverlay {
    fn epoch(&self) -> u64 {
        0
    }

    fn for_each_overlay_flake(
        &self,
        _index: IndexType,
        _first: Option<&Flake>,
        _rhs: Option<&Flake>,
        _leftmost: bool,
        _to_t: i64,
        _callback: &mut dyn FnMut(&Flake),
    ) {
    }
}
