//! Tree rebalancing: rebuild one ordering from a sorted flake stream.
//!
//! A rebuild streams every visible flake of an ordering (persisted tree
//! merged with novelty, stale facts removed), chunks the stream into
//! leaves by byte size, then folds child references into branches level
//! by level until a single root remains. The output shares no node with
//! the previous tree; old nodes become garbage.
//!
//! # Boundaries
//!
//! Consecutive leaves tile the key space: each leaf's `rhs` is the first
//! flake of the next leaf, the final leaf's `rhs` is `None`, and only the
//! first leaf carries `leftmost`. Branches take `first` from their first
//! child and `rhs` from their last.

use crate::config::IndexerConfig;
use crate::error::{IndexerError, Result};
use crate::writer::IndexWriter;
use strata_db_core::codec::{serialize_branch_node, serialize_leaf_node};
use strata_db_core::{
    ChildRef, ContentAddressedWrite, Db, Flake, IndexType, NodeCache, OverlayProvider,
    RangeCursor, RangeOptions, StorageRead,
};

/// Rebuild one ordering's tree at `target_t` and return the new root ref.
pub async fn rebalance_index<S, C, O>(
    db: &Db<S, C>,
    overlay: &O,
    index: IndexType,
    target_t: i64,
    config: &IndexerConfig,
    writer: &mut IndexWriter<'_, S>,
) -> Result<ChildRef>
where
    S: StorageRead + ContentAddressedWrite,
    C: NodeCache,
    O: OverlayProvider + ?Sized,
{
    tracing::debug!(index = %index, target_t, "rebalancing ordering");

    // History mode: leaves persist every version and retraction, so
    // queries can reconstruct any historical t. Stale removal stays a
    // query-time concern.
    let opts = RangeOptions::new().with_to_t(target_t).with_history_mode();
    let mut cursor = RangeCursor::new_bounded(
        db,
        index,
        Flake::min_sentinel(),
        Flake::max_sentinel(),
        opts,
    )?;

    let mut leaves: Vec<ChildRef> = Vec::new();
    let mut current: Vec<Flake> = Vec::new();
    let mut current_bytes: u64 = 0;

    while let Some(leaf_flakes) = cursor.next_leaf(db, overlay).await? {
        for flake in leaf_flakes {
            let flake_bytes = flake.size_estimate_bytes();

            // Close the current leaf when this flake would overflow it.
            // A lone flake larger than the target still forms its own
            // leaf, so the build never stalls.
            if !current.is_empty() && current_bytes + flake_bytes > config.leaf_target_bytes {
                let leftmost = leaves.is_empty();
                let chunk = std::mem::take(&mut current);
                current_bytes = 0;
                leaves.push(write_leaf(&chunk, leftmost, Some(flake.clone()), writer).await?);
            }

            current_bytes += flake_bytes;
            current.push(flake);
        }
    }

    // Final chunk. An empty ordering still gets one empty leftmost leaf
    // so every tree has a resolvable root.
    let leftmost = leaves.is_empty();
    leaves.push(write_leaf(&current, leftmost, None, writer).await?);

    fold_to_root(leaves, config, writer).await
}

/// Write one leaf and return its child ref.
async fn write_leaf<S: ContentAddressedWrite>(
    flakes: &[Flake],
    leftmost: bool,
    rhs: Option<Flake>,
    writer: &mut IndexWriter<'_, S>,
) -> Result<ChildRef> {
    // Leftmost carries no left boundary; it covers everything below.
    let first = if leftmost {
        None
    } else {
        flakes.first().cloned()
    };

    let serialized = serialize_leaf_node(flakes).map_err(IndexerError::Core)?;
    let serialized_len = serialized.len() as u64;
    let address = writer.write_leaf(&serialized).await?;

    Ok(ChildRef {
        id: address,
        leaf: true,
        first,
        rhs,
        size: flakes.len() as u64,
        bytes: Some(serialized_len),
        leftmost,
    })
}

/// Write one branch over a group of children and return its child ref.
async fn write_branch<S: ContentAddressedWrite>(
    children: &[ChildRef],
    writer: &mut IndexWriter<'_, S>,
) -> Result<ChildRef> {
    let leftmost = children.first().is_some_and(|c| c.leftmost);
    let first = children.first().and_then(|c| c.first.clone());
    let rhs = children.last().and_then(|c| c.rhs.clone());
    let size: u64 = children.iter().map(|c| c.size).sum();

    let serialized = serialize_branch_node(children).map_err(IndexerError::Core)?;
    let serialized_len = serialized.len() as u64;
    let address = writer.write_branch(&serialized).await?;

    Ok(ChildRef {
        id: address,
        leaf: false,
        first,
        rhs,
        size,
        bytes: Some(serialized_len),
        leftmost,
    })
}

/// Fold child refs into branches of at most `branch_target_children`,
/// level by level, until one node remains. A lone leaf is itself the
/// root; folding only happens while more than one node remains.
async fn fold_to_root<S: ContentAddressedWrite>(
    mut level: Vec<ChildRef>,
    config: &IndexerConfig,
    writer: &mut IndexWriter<'_, S>,
) -> Result<ChildRef> {
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len() / config.branch_target_children + 1);
        for group in level.chunks(config.branch_target_children) {
            next.push(write_branch(group, writer).await?);
        }
        level = next;
    }

    level
        .into_iter()
        .next()
        .ok_or_else(|| IndexerError::StorageWrite("rebalance produced no nodes".to_string()))
}
