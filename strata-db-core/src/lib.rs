//! # Strata DB Core
//!
//! Runtime-agnostic core for the Strata temporal graph index.
//!
//! This crate provides:
//! - Core types: `Sid`, `FlakeValue`, `Flake`
//! - Index comparators for all 5 orderings (SPOT, PSOT, POST, OPST, TSPO)
//! - Storage, cache, and overlay trait interfaces
//! - Node resolution with temporal materialization
//! - Range query implementation and streaming cursors
//!
//! ## Design Principles
//!
//! 1. **Async at the I/O seam only**: traversal is synchronous once data
//!    is in memory
//! 2. **Strict total ordering**: no nil-as-wildcard; bounds use explicit
//!    min/max sentinels
//! 3. **Immutable snapshots**: a `Db` never changes; new indexes produce
//!    new `Db` values
//!
//! ## Example
//!
//! ```ignore
//! use strata_db_core::{Db, range, IndexType, RangeTest, RangeMatch, RangeOptions};
//!
//! let db = Db::load(storage, cache, root_address).await?;
//! let flakes = range(
//!     &db,
//!     IndexType::Spot,
//!     RangeTest::Eq,
//!     RangeMatch::subject(sid),
//!     RangeOptions::default(),
//! ).await?;
//! ```

pub mod cache;
pub mod codec;
pub mod comparator;
pub mod db;
pub mod error;
pub mod flake;
pub mod index;
pub mod overlay;
pub mod range;
pub mod resolve;
pub mod sid;
pub mod storage;
pub mod value;

// Re-export main types
pub use cache::{CacheKey, CacheKind, CacheStats, NoCache, NodeCache, SimpleCache};
pub use codec::{
    parse_branch_node, parse_garbage_record, parse_leaf_node, parse_root_record,
    serialize_branch_node, serialize_garbage_record, serialize_leaf_node, serialize_root_record,
    GarbageRecord, GarbageRef, PrevIndexRef, RootRecord, RootStats,
};
pub use comparator::IndexType;
pub use db::Db;
pub use error::{Error, Result};
pub use flake::{size_flakes_estimate, Flake, FlakeMeta, DT_REF};
pub use index::{empty_root, ChildRef, IndexNode, NodeId, ResolvedNode, EMPTY_NODE_ID};
pub use overlay::{NoOverlay, OverlayProvider};
pub use range::{
    range, range_bounded_with_overlay, range_with_overlay, MultiSeekCursor, ObjectBounds,
    RangeCursor, RangeMatch, RangeOptions, RangeTest, DEFAULT_PREFETCH_N,
};
pub use resolve::{
    in_time_window, merge_sorted, remove_stale_flakes, resolve_node_materialized_with_overlay,
};
pub use sid::Sid;
pub use storage::{
    alias_prefix_for_path, content_address, content_path, sha256_hex, ContentAddressedWrite,
    ContentKind, ContentWriteResult, MemoryStorage, Storage, StorageRead, StorageWrite,
};
#[cfg(all(feature = "native", not(target_arch = "wasm32")))]
pub use storage::FileStorage;
pub use value::FlakeValue;
