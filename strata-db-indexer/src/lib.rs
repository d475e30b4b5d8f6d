//! # Strata DB Indexer
//!
//! Turns a database plus its novelty overlay into a fresh set of
//! persisted index trees. A rebuild is a pure rewrite: every ordering is
//! streamed in comparator order (persisted tree merged with novelty,
//! stale facts removed), re-chunked into leaves, folded into branches,
//! and written content-addressed. The previous tree is untouched and
//! becomes garbage, retained for a configurable number of generations so
//! readers holding older roots keep working.
//!
//! # Modules
//!
//! - [`config`]: size and retention thresholds
//! - [`rebalance`]: per-ordering leaf chunking and branch folding
//! - [`writer`]: content-addressed node persistence
//! - [`gc`]: garbage records and retention of superseded roots

pub mod config;
pub mod error;
pub mod gc;
pub mod rebalance;
pub mod writer;

pub use config::IndexerConfig;
pub use error::{IndexerError, Result};
pub use gc::{collect_garbage, GcStats};
pub use rebalance::rebalance_index;
pub use writer::IndexWriter;

use gc::collect_tree_addresses;
use strata_db_core::codec::serialize_garbage_record;
use strata_db_core::{
    serialize_root_record, ContentAddressedWrite, Db, GarbageRecord, GarbageRef, IndexType,
    NodeCache, PrevIndexRef, RootRecord, RootStats, StorageRead,
};
use strata_db_novelty::Novelty;

/// Statistics from one index build.
#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    /// Flakes in each rebuilt ordering.
    pub flake_count: u64,
    /// Leaves written across all 5 orderings.
    pub leaf_count: usize,
    /// Branches written across all 5 orderings.
    pub branch_count: usize,
    /// Total bytes written, root record included.
    pub total_bytes: usize,
}

/// Result of a completed reindex.
#[derive(Debug, Clone)]
pub struct IndexResult {
    /// Address of the new root record.
    pub root_address: String,
    /// Transaction time the new index covers.
    pub index_t: i64,
    pub stats: IndexStats,
}

/// Rebuild all 5 orderings and write a new root record.
///
/// `prev_root_address` is the address of the root record being
/// superseded, when one exists; it is recorded on the new root for the
/// garbage collection chain, together with a garbage record listing the
/// old tree's node addresses.
pub async fn reindex<S, C>(
    db: &Db<S, C>,
    novelty: &Novelty,
    config: &IndexerConfig,
    prev_root_address: Option<String>,
) -> Result<IndexResult>
where
    S: StorageRead + ContentAddressedWrite,
    C: NodeCache,
{
    config.validate()?;

    let index_t = db.t.max(novelty.t);
    tracing::info!(
        alias = %db.alias,
        index_t,
        novelty_bytes = novelty.size,
        "starting index rebuild"
    );

    let mut writer = IndexWriter::new(&db.storage, &db.alias);
    let mut roots = Vec::with_capacity(5);
    let mut spot_bytes = 0;
    for (i, &index) in IndexType::all().iter().enumerate() {
        roots.push(
            rebalance_index(db, novelty, index, index_t, config, &mut writer).await?,
        );
        if i == 0 {
            spot_bytes = writer.total_bytes();
        }
    }
    let flake_count = roots.first().map(|r| r.size).unwrap_or(0);

    // Orphaned nodes of the superseded tree, recorded for later GC.
    let garbage = if prev_root_address.is_some() && !db.is_genesis() {
        let mut nodes = Vec::new();
        for &index in IndexType::all() {
            let old_root = db.get_index_root(index).map_err(IndexerError::Core)?;
            nodes.extend(collect_tree_addresses(&db.storage, &old_root.id, old_root.leaf).await?);
        }

        if nodes.is_empty() {
            None
        } else {
            let record = GarbageRecord::new(db.alias.clone(), db.t, nodes);
            let bytes = serialize_garbage_record(&record).map_err(IndexerError::Core)?;
            let address = writer.write_garbage(&bytes).await?;
            Some(GarbageRef { address })
        }
    } else {
        None
    };

    let mut root_iter = roots.into_iter();
    let record = RootRecord {
        alias: db.alias.clone(),
        t: index_t,
        spot: root_iter.next(),
        psot: root_iter.next(),
        post: root_iter.next(),
        opst: root_iter.next(),
        tspo: root_iter.next(),
        stats: Some(RootStats {
            flakes: flake_count,
            size: spot_bytes as u64,
        }),
        timestamp: Some(now_millis()),
        prev_index: prev_root_address.map(|address| PrevIndexRef { t: db.t, address }),
        garbage,
        namespaces: db.namespace_codes.clone(),
    };

    let bytes = serialize_root_record(&record).map_err(IndexerError::Core)?;
    let root_address = writer.write_root(&bytes).await?;

    let stats = IndexStats {
        flake_count,
        leaf_count: writer.leaf_count(),
        branch_count: writer.branch_count(),
        total_bytes: writer.total_bytes(),
    };

    tracing::info!(
        root_address = %root_address,
        index_t,
        flakes = stats.flake_count,
        leaves = stats.leaf_count,
        branches = stats.branch_count,
        "index rebuild complete"
    );

    Ok(IndexResult {
        root_address,
        index_t,
        stats,
    })
}

/// Wall-clock millis for the root record timestamp.
fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_db_core::{
        FlakeValue, MemoryStorage, NoOverlay, RangeCursor, RangeOptions, Sid, SimpleCache,
    };
    use strata_db_novelty::Commit;

    fn genesis_db() -> Db<MemoryStorage, SimpleCache> {
        Db::genesis(MemoryStorage::new(), SimpleCache::new(4096), "mydb:main")
    }

    fn bulk_commit(t: i64, subjects: std::ops::Range<u32>) -> Commit {
        let mut commit = Commit::new(t);
        for s in subjects {
            commit = commit.assert_fact(
                Sid::new((s % 60_000) as u16, format!("s{}", s)),
                Sid::new(1, "score"),
                FlakeValue::Long(s as i64),
                Sid::new(2, "long"),
            );
        }
        commit
    }

    async fn full_scan(db: &Db<MemoryStorage, SimpleCache>, index: IndexType) -> Vec<strata_db_core::Flake> {
        let mut cursor = RangeCursor::new_bounded(
            db,
            index,
            strata_db_core::Flake::min_sentinel(),
            strata_db_core::Flake::max_sentinel(),
            RangeOptions::new(),
        )
        .unwrap();
        cursor.collect_all(db, &NoOverlay).await.unwrap()
    }

    #[tokio::test]
    async fn test_reindex_from_genesis() {
        let db = genesis_db();
        let mut novelty = Novelty::new(0);
        novelty.apply_commit(bulk_commit(1, 0..50)).unwrap();

        let result = reindex(&db, &novelty, &IndexerConfig::default(), None)
            .await
            .unwrap();

        assert_eq!(result.index_t, 1);
        assert_eq!(result.stats.flake_count, 50);
        // One leaf per ordering at this scale.
        assert_eq!(result.stats.leaf_count, 5);

        let loaded = Db::load(
            db.storage.clone(),
            SimpleCache::new(4096),
            &result.root_address,
        )
        .await
        .unwrap();
        assert_eq!(loaded.t, 1);

        let flakes = full_scan(&loaded, IndexType::Spot).await;
        assert_eq!(flakes.len(), 50);
    }

    #[tokio::test]
    async fn test_reindex_validates_config() {
        let db = genesis_db();
        let mut novelty = Novelty::new(0);
        novelty.apply_commit(bulk_commit(1, 0..5)).unwrap();

        let mut config = IndexerConfig::default();
        config.leaf_target_bytes = 0;
        let err = reindex(&db, &novelty, &config, None).await.unwrap_err();
        assert!(matches!(err, IndexerError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_reindex_records_prev_and_garbage() {
        let storage = MemoryStorage::new();
        let db = Db::genesis(storage.clone(), SimpleCache::new(4096), "mydb:main");

        let mut novelty = Novelty::new(0);
        novelty.apply_commit(bulk_commit(1, 0..20)).unwrap();
        let first = reindex(&db, &novelty, &IndexerConfig::default(), None)
            .await
            .unwrap();

        let db = Db::load(storage.clone(), SimpleCache::new(4096), &first.root_address)
            .await
            .unwrap();
        let mut novelty = Novelty::new(db.t);
        novelty.apply_commit(bulk_commit(2, 20..40)).unwrap();
        let second = reindex(
            &db,
            &novelty,
            &IndexerConfig::default(),
            Some(first.root_address.clone()),
        )
        .await
        .unwrap();

        let bytes = storage.read_bytes(&second.root_address).await.unwrap();
        let record = strata_db_core::parse_root_record(&bytes).unwrap();
        assert_eq!(
            record.prev_index.as_ref().map(|p| p.address.as_str()),
            Some(first.root_address.as_str())
        );

        let root_stats = record.stats.unwrap();
        assert_eq!(root_stats.flakes, 40);
        assert!(root_stats.size > 0);

        // The garbage record lists the superseded tree's nodes: 5 leaves.
        let garbage_address = record.garbage.unwrap().address;
        let garbage_bytes = storage.read_bytes(&garbage_address).await.unwrap();
        let garbage = strata_db_core::parse_garbage_record(&garbage_bytes).unwrap();
        assert_eq!(garbage.nodes.len(), 5);
        assert_eq!(garbage.t, 1);
    }

    /// Scale pass: 10k flakes through commits and a rebuild; the tree
    /// obeys size bounds and a full scan returns everything in order.
    #[tokio::test]
    async fn test_reindex_ten_thousand_flakes() {
        let db = genesis_db();
        let mut novelty = Novelty::new(0);
        novelty.apply_commit(bulk_commit(1, 0..5_000)).unwrap();
        novelty.apply_commit(bulk_commit(2, 5_000..10_000)).unwrap();

        // Small thresholds so the build produces a real multi-level tree.
        let config = IndexerConfig::new(4_000, 8_000, 10, 20);
        let result = reindex(&db, &novelty, &config, None).await.unwrap();

        assert_eq!(result.index_t, 2);
        assert_eq!(result.stats.flake_count, 10_000);
        assert!(result.stats.leaf_count > 5);
        assert!(result.stats.branch_count > 5);

        let loaded = Db::load(
            db.storage.clone(),
            SimpleCache::new(100_000),
            &result.root_address,
        )
        .await
        .unwrap();

        for &index in IndexType::all() {
            let flakes = full_scan(&loaded, index).await;
            assert_eq!(flakes.len(), 10_000, "{} lost flakes", index);
            let cmp = index.comparator();
            for pair in flakes.windows(2) {
                assert_ne!(
                    cmp(&pair[0], &pair[1]),
                    std::cmp::Ordering::Greater,
                    "{} out of order",
                    index
                );
            }
        }
    }
}
