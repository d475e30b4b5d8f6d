//! Garbage retention for superseded index roots.
//!
//! A rebuild is a pure rewrite, so the whole previous tree becomes
//! garbage the moment a new root is written. Nodes are not deleted
//! immediately: readers loaded from an older root may still be
//! traversing it. Instead, each rebuild writes a garbage record listing
//! the superseded tree's node addresses, and [`collect_garbage`] deletes
//! records older than the retention window.

use crate::error::{IndexerError, Result};
use strata_db_core::codec::parse_garbage_record;
use strata_db_core::{
    parse_branch_node, parse_root_record, RootRecord, StorageRead, StorageWrite, EMPTY_NODE_ID,
};

/// Counters from one garbage collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Superseded root records deleted.
    pub roots_deleted: usize,
    /// Tree nodes and garbage records deleted.
    pub nodes_deleted: usize,
}

/// Collect every node address in one ordering's tree, root included.
///
/// Walks branches through storage; the genesis sentinel is skipped since
/// it has no stored blob.
pub async fn collect_tree_addresses<S: StorageRead>(
    storage: &S,
    root_id: &str,
    root_is_leaf: bool,
) -> Result<Vec<String>> {
    let mut addresses = Vec::new();
    let mut stack: Vec<(String, bool)> = vec![(root_id.to_string(), root_is_leaf)];

    while let Some((id, leaf)) = stack.pop() {
        if id == EMPTY_NODE_ID {
            continue;
        }
        if leaf {
            addresses.push(id);
            continue;
        }

        let bytes = storage
            .read_bytes(&id)
            .await
            .map_err(|e| IndexerError::StorageRead(e.to_string()))?;
        let children = parse_branch_node(&bytes).map_err(IndexerError::Core)?;
        for child in children {
            stack.push((child.id, child.leaf));
        }
        addresses.push(id);
    }

    Ok(addresses)
}

/// Delete index generations older than the retention window.
///
/// Walks the `prev_index` chain from `current_root_address`, keeps the
/// newest `keep_roots` superseded generations, and deletes everything
/// older: the tree nodes listed in the superseding root's garbage
/// record, the garbage record itself, and the old root record.
///
/// Deletes are idempotent, so re-running after a partial pass is safe.
pub async fn collect_garbage<S>(
    storage: &S,
    current_root_address: &str,
    keep_roots: u32,
) -> Result<GcStats>
where
    S: StorageRead + StorageWrite,
{
    // Chain of (address, record), newest first.
    let mut chain: Vec<(String, RootRecord)> = Vec::new();
    let mut cursor = Some(current_root_address.to_string());

    while let Some(address) = cursor {
        let bytes = match storage.read_bytes(&address).await {
            Ok(bytes) => bytes,
            // A previous pass already collected this root; the chain
            // ends here.
            Err(strata_db_core::Error::NotFound(_)) if !chain.is_empty() => break,
            Err(e) => return Err(IndexerError::StorageRead(e.to_string())),
        };
        let record = parse_root_record(&bytes).map_err(IndexerError::Core)?;
        cursor = record.prev_index.as_ref().map(|p| p.address.clone());
        chain.push((address, record));
    }

    let mut stats = GcStats::default();

    // chain[0] is live; chain[1..=keep_roots] are retained generations.
    // The garbage record on chain[i] lists the tree of chain[i + 1].
    for i in (keep_roots as usize + 1)..chain.len() {
        let (old_address, _) = &chain[i];
        let superseding = &chain[i - 1].1;

        if let Some(ref garbage_ref) = superseding.garbage {
            let bytes = match storage.read_bytes(&garbage_ref.address).await {
                Ok(bytes) => bytes,
                // Already collected by an interrupted pass.
                Err(strata_db_core::Error::NotFound(_)) => {
                    storage
                        .delete(old_address)
                        .await
                        .map_err(|e| IndexerError::StorageWrite(e.to_string()))?;
                    stats.roots_deleted += 1;
                    continue;
                }
                Err(e) => return Err(IndexerError::StorageRead(e.to_string())),
            };
            let garbage = parse_garbage_record(&bytes).map_err(IndexerError::Core)?;

            for node in &garbage.nodes {
                storage
                    .delete(node)
                    .await
                    .map_err(|e| IndexerError::StorageWrite(e.to_string()))?;
                stats.nodes_deleted += 1;
            }

            storage
                .delete(&garbage_ref.address)
                .await
                .map_err(|e| IndexerError::StorageWrite(e.to_string()))?;
            stats.nodes_deleted += 1;
        }

        storage
            .delete(old_address)
            .await
            .map_err(|e| IndexerError::StorageWrite(e.to_string()))?;
        stats.roots_deleted += 1;

        tracing::debug!(address = %old_address, "deleted superseded index root");
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexerConfig;
    use crate::reindex;
    use strata_db_core::{Db, FlakeValue, MemoryStorage, Sid, SimpleCache};
    use strata_db_novelty::{Commit, Novelty};

    fn assert_commit(t: i64, s: u16) -> Commit {
        Commit::new(t).assert_fact(
            Sid::new(s, format!("s{}", s)),
            Sid::new(1, "name"),
            FlakeValue::Long(t),
            Sid::new(2, "long"),
        )
    }

    /// Build a chain of index generations, then collect with a window
    /// of one retained generation.
    #[tokio::test]
    async fn test_collect_garbage_retains_window() {
        let storage = MemoryStorage::new();
        let mut db = Db::genesis(storage.clone(), SimpleCache::new(1024), "mydb:main");
        let config = IndexerConfig::default();

        let mut prev_address: Option<String> = None;
        let mut addresses = Vec::new();

        for generation in 1..=4i64 {
            let mut novelty = Novelty::new(db.t);
            novelty
                .apply_commit(assert_commit(generation, generation as u16))
                .unwrap();

            let result = reindex(&db, &novelty, &config, prev_address.clone())
                .await
                .unwrap();
            addresses.push(result.root_address.clone());
            prev_address = Some(result.root_address.clone());

            db = Db::load(
                storage.clone(),
                SimpleCache::new(1024),
                &result.root_address,
            )
            .await
            .unwrap();
        }

        let stats = collect_garbage(&storage, &addresses[3], 1).await.unwrap();

        // Chain is gen4 -> gen3 -> gen2 -> gen1: gen3 retained, gen2 and
        // gen1 deleted.
        assert_eq!(stats.roots_deleted, 2);
        assert!(stats.nodes_deleted > 0);

        assert!(storage.exists(&addresses[3]).await.unwrap());
        assert!(storage.exists(&addresses[2]).await.unwrap());
        assert!(!storage.exists(&addresses[1]).await.unwrap());
        assert!(!storage.exists(&addresses[0]).await.unwrap());

        // The live generation still loads and resolves.
        let live = Db::load(storage.clone(), SimpleCache::new(1024), &addresses[3])
            .await
            .unwrap();
        assert_eq!(live.t, 4);
    }

    #[tokio::test]
    async fn test_collect_garbage_is_idempotent() {
        let storage = MemoryStorage::new();
        let mut db = Db::genesis(storage.clone(), SimpleCache::new(1024), "mydb:main");
        let config = IndexerConfig::default();

        let mut prev_address: Option<String> = None;
        let mut last_address = String::new();

        for generation in 1..=3i64 {
            let mut novelty = Novelty::new(db.t);
            novelty
                .apply_commit(assert_commit(generation, generation as u16))
                .unwrap();
            let result = reindex(&db, &novelty, &config, prev_address.clone())
                .await
                .unwrap();
            prev_address = Some(result.root_address.clone());
            last_address = result.root_address.clone();
            db = Db::load(
                storage.clone(),
                SimpleCache::new(1024),
                &result.root_address,
            )
            .await
            .unwrap();
        }

        let first = collect_garbage(&storage, &last_address, 0).await.unwrap();
        assert_eq!(first.roots_deleted, 2);

        // Second pass finds nothing left to delete.
        let second = collect_garbage(&storage, &last_address, 0).await.unwrap();
        assert_eq!(second, GcStats::default());
    }
}
