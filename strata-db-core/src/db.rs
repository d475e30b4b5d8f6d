//! Database value.
//!
//! A `Db` is an immutable snapshot of one ledger's indexes at a specific
//! transaction time, generic over storage and cache. Queries against a
//! genesis `Db` (no index written yet) return overlay flakes only.

use crate::cache::NodeCache;
use crate::codec::{parse_root_record, RootRecord, RootStats};
use crate::comparator::IndexType;
use crate::error::{Error, Result};
use crate::index::{empty_root, ChildRef, IndexNode};
use crate::storage::StorageRead;
use std::collections::BTreeMap;

pub use crate::index::EMPTY_NODE_ID;

/// Database snapshot at a specific transaction time.
pub struct Db<S, C> {
    /// Ledger alias, e.g. `mydb:main`.
    pub alias: String,
    /// Transaction time the persisted indexes cover.
    pub t: i64,
    /// Root node per ordering.
    pub spot: IndexNode,
    pub psot: IndexNode,
    pub post: IndexNode,
    pub opst: IndexNode,
    pub tspo: IndexNode,
    /// Whole-index statistics from the root record.
    pub stats: Option<RootStats>,
    /// Namespace code table from the root record.
    pub namespace_codes: BTreeMap<u16, String>,
    /// Node cache shared across queries.
    pub cache: C,
    /// Storage backend.
    pub storage: S,
}

impl<S: Clone, C: Clone> Clone for Db<S, C> {
    fn clone(&self) -> Self {
        Self {
            alias: self.alias.clone(),
            t: self.t,
            spot: self.spot.clone(),
            psot: self.psot.clone(),
            post: self.post.clone(),
            opst: self.opst.clone(),
            tspo: self.tspo.clone(),
            stats: self.stats,
            namespace_codes: self.namespace_codes.clone(),
            cache: self.cache.clone(),
            storage: self.storage.clone(),
        }
    }
}

impl<S, C> std::fmt::Debug for Db<S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("alias", &self.alias)
            .field("t", &self.t)
            .field("spot", &self.spot.id)
            .finish_non_exhaustive()
    }
}

impl<S, C> Db<S, C> {
    /// Create a genesis (empty) database for a new ledger.
    ///
    /// Starts at t=0 with the empty-root sentinel in every ordering, so
    /// no storage reads happen until a first index is written.
    pub fn genesis(storage: S, cache: C, alias: &str) -> Self {
        Self {
            alias: alias.to_string(),
            t: 0,
            spot: empty_root(IndexType::Spot),
            psot: empty_root(IndexType::Psot),
            post: empty_root(IndexType::Post),
            opst: empty_root(IndexType::Opst),
            tspo: empty_root(IndexType::Tspo),
            stats: None,
            namespace_codes: BTreeMap::new(),
            cache,
            storage,
        }
    }

    /// Build a `Db` from an already-parsed root record.
    pub fn from_root_record(storage: S, cache: C, root: &RootRecord) -> Self {
        fn node_for(entry: &Option<ChildRef>, index: IndexType, t: i64) -> IndexNode {
            match entry {
                Some(child) => IndexNode::from_child_ref(child, index, t),
                None => empty_root(index),
            }
        }

        Self {
            alias: root.alias.clone(),
            t: root.t,
            spot: node_for(&root.spot, IndexType::Spot, root.t),
            psot: node_for(&root.psot, IndexType::Psot, root.t),
            post: node_for(&root.post, IndexType::Post, root.t),
            opst: node_for(&root.opst, IndexType::Opst, root.t),
            tspo: node_for(&root.tspo, IndexType::Tspo, root.t),
            stats: root.stats,
            namespace_codes: root.namespaces.clone(),
            cache,
            storage,
        }
    }

    /// Get the root node for an ordering.
    pub fn get_index_root(&self, index: IndexType) -> Result<IndexNode> {
        let root = match index {
            IndexType::Spot => &self.spot,
            IndexType::Psot => &self.psot,
            IndexType::Post => &self.post,
            IndexType::Opst => &self.opst,
            IndexType::Tspo => &self.tspo,
        };
        if root.index_type != index {
            return Err(Error::invalid_index(format!(
                "root for {} carries index type {}",
                index, root.index_type
            )));
        }
        Ok(root.clone())
    }

    /// True if no index has been written yet.
    pub fn is_genesis(&self) -> bool {
        self.spot.is_empty_root()
    }
}

impl<S: StorageRead, C: NodeCache> Db<S, C> {
    /// Load a database from a root record address.
    pub async fn load(storage: S, cache: C, root_address: &str) -> Result<Self> {
        let bytes = storage.read_bytes(root_address).await?;
        let root = parse_root_record(&bytes)?;
        Ok(Self::from_root_record(storage, cache, &root))
    }
}
