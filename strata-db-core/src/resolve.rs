//! Node resolution and temporal materialization.
//!
//! Resolving a node turns boundary metadata into content: branches load
//! their child references, leaves load raw flakes and then materialize
//! them for a time window. Materialization filters to the window, merges
//! overlay flakes, and removes stale facts so each live fact surfaces
//! exactly once. Branches cache under a raw key (time-independent);
//! leaves cache twice, raw bytes once and each materialization under a
//! key carrying the window, overlay epoch, and history mode.

use crate::cache::{CacheKey, NodeCache};
use crate::codec::{parse_branch_node, parse_leaf_node};
use crate::db::Db;
use crate::error::Result;
use crate::flake::Flake;
use crate::index::{IndexNode, ResolvedNode};
use crate::overlay::OverlayProvider;
use crate::storage::StorageRead;
use rustc_hash::FxHashSet;
use std::sync::Arc;

/// Check if a flake falls within the given time window.
///
/// `to_t` is the inclusive ceiling; `from_t`, when set, is the inclusive
/// floor used by history queries.
pub fn in_time_window(f: &Flake, from_t: Option<i64>, to_t: i64) -> bool {
    f.t <= to_t && from_t.is_none_or(|ft| f.t >= ft)
}

// =========================================================================
// Stale-flake removal (fact key deduplication)
// =========================================================================

/// A fact key that borrows from a `Flake`, used for deduplication.
///
/// Ignores `t` and `op` so the newest occurrence of each fact
/// (subject, predicate, object, datatype, meta) wins.
#[derive(Clone, Copy, Hash, PartialEq, Eq)]
struct FactKeyRef<'a> {
    s: &'a crate::sid::Sid,
    p: &'a crate::sid::Sid,
    o: &'a crate::value::FlakeValue,
    dt: &'a crate::sid::Sid,
    meta_hash: i32,
}

impl<'a> FactKeyRef<'a> {
    fn from_flake(f: &'a Flake) -> Self {
        Self {
            s: &f.s,
            p: &f.p,
            o: &f.o,
            dt: &f.dt,
            meta_hash: flake_meta_hash(f),
        }
    }
}

/// Stable hash of a flake's metadata, folded into the fact key.
fn flake_meta_hash(f: &Flake) -> i32 {
    match &f.m {
        None => 0,
        Some(m) => {
            if let Some(i) = m.i {
                i
            } else if let Some(lang) = &m.lang {
                use std::hash::{Hash, Hasher};
                let mut h = std::collections::hash_map::DefaultHasher::new();
                lang.hash(&mut h);
                (h.finish() & 0x7FFF_FFFF) as i32
            } else {
                0
            }
        }
    }
}

/// Remove stale flakes from an owned vector.
///
/// Iterates in reverse (newest occurrence of each fact first), keeps only
/// the first occurrence of each fact key, and drops retractions. A
/// retraction seen first shadows every older assertion of the same fact.
pub fn remove_stale_flakes(flakes: Vec<Flake>) -> Vec<Flake> {
    let mut seen: FxHashSet<FactKeyRef<'_>> = FxHashSet::default();
    let mut keep = vec![false; flakes.len()];

    for (idx, f) in flakes.iter().enumerate().rev() {
        if !seen.insert(FactKeyRef::from_flake(f)) {
            continue;
        }
        if f.op {
            keep[idx] = true;
        }
    }

    flakes
        .into_iter()
        .zip(keep)
        .filter_map(|(f, k)| k.then_some(f))
        .collect()
}

/// Remove stale flakes from a borrowed slice, applying a time filter.
///
/// Combines window filtering and fact-key deduplication in a single
/// reverse pass, cloning only the assertions that survive both.
fn remove_stale_flakes_in_window(flakes: &[Flake], from_t: Option<i64>, to_t: i64) -> Vec<Flake> {
    let mut seen: FxHashSet<FactKeyRef<'_>> = FxHashSet::default();
    let mut out_rev: Vec<Flake> = Vec::new();

    for f in flakes.iter().rev() {
        if !in_time_window(f, from_t, to_t) {
            continue;
        }
        if !seen.insert(FactKeyRef::from_flake(f)) {
            continue;
        }
        if f.op {
            out_rev.push(f.clone());
        }
    }

    out_rev.reverse();
    out_rev
}

fn materialize_raw_leaf_no_overlay(
    raw_flakes: &[Flake],
    from_t: Option<i64>,
    to_t: i64,
    history_mode: bool,
) -> Vec<Flake> {
    if history_mode {
        // History mode keeps everything in the window, retractions included.
        return raw_flakes
            .iter()
            .filter(|f| in_time_window(f, from_t, to_t))
            .cloned()
            .collect();
    }

    remove_stale_flakes_in_window(raw_flakes, from_t, to_t)
}

/// Merge two vectors already sorted under `cmp` into one sorted vector.
pub fn merge_sorted(
    left: Vec<Flake>,
    right: Vec<Flake>,
    cmp: fn(&Flake, &Flake) -> std::cmp::Ordering,
) -> Vec<Flake> {
    if left.is_empty() {
        return right;
    }
    if right.is_empty() {
        return left;
    }

    let mut out = Vec::with_capacity(left.len() + right.len());
    let mut li = left.into_iter();
    let mut ri = right.into_iter();
    let mut a = li.next();
    let mut b = ri.next();

    loop {
        match (a.take(), b.take()) {
            (Some(l), Some(r)) => {
                if cmp(&l, &r) != std::cmp::Ordering::Greater {
                    out.push(l);
                    a = li.next();
                    b = Some(r);
                } else {
                    out.push(r);
                    b = ri.next();
                    a = Some(l);
                }
            }
            (Some(l), None) => {
                out.push(l);
                out.extend(li);
                break;
            }
            (None, Some(r)) => {
                out.push(r);
                out.extend(ri);
                break;
            }
            (None, None) => break,
        }
    }

    out
}

/// Collect overlay flakes for a node's window, sorted and time-filtered.
fn collect_overlay_flakes<O>(
    overlay: &O,
    node: &IndexNode,
    from_t: Option<i64>,
    to_t: i64,
) -> Vec<Flake>
where
    O: OverlayProvider + ?Sized,
{
    let mut overlay_flakes: Vec<Flake> = Vec::new();
    overlay.for_each_overlay_flake(
        node.index_type,
        node.first.as_ref(),
        node.rhs.as_ref(),
        node.leftmost,
        to_t,
        &mut |f| {
            if in_time_window(f, from_t, to_t) {
                overlay_flakes.push(f.clone());
            }
        },
    );
    overlay_flakes
}

/// Resolve a node, materializing leaves for the requested time window and
/// merging overlay flakes into the leaf's range.
///
/// The cache key for a materialized leaf includes the overlay epoch, so a
/// new commit invalidates cached materializations without a flush.
pub async fn resolve_node_materialized_with_overlay<S, C, O>(
    db: &Db<S, C>,
    overlay: &O,
    overlay_epoch: u64,
    node: &IndexNode,
    from_t: Option<i64>,
    to_t: i64,
    history_mode: bool,
) -> Result<ResolvedNode>
where
    S: StorageRead,
    C: NodeCache,
    O: OverlayProvider + ?Sized,
{
    // Genesis empty root: synthesize the leaf from the overlay alone,
    // never touching storage.
    if node.leaf && node.is_empty_root() {
        let cmp = node.index_type.comparator();
        let mut overlay_flakes = collect_overlay_flakes(overlay, node, from_t, to_t);
        overlay_flakes.sort_by(cmp);

        let materialized = if history_mode {
            overlay_flakes
        } else {
            remove_stale_flakes(overlay_flakes)
        };

        return Ok(ResolvedNode::leaf(
            node.clone(),
            Arc::from(materialized.into_boxed_slice()),
        ));
    }

    if !node.leaf {
        // Branch nodes are time-independent; cache raw.
        let key = CacheKey::raw(node.id.as_str());
        return db
            .cache
            .get_or_fetch(&key, || async {
                let bytes = db.storage.read_bytes(&node.id).await?;
                let children = parse_branch_node(&bytes)?;
                Ok(ResolvedNode::branch(
                    node.clone(),
                    Arc::from(children.into_boxed_slice()),
                ))
            })
            .await;
    }

    // Leaf: first ensure the raw decoded leaf is cached.
    let raw_key = CacheKey::raw(node.id.as_str());
    let raw_leaf = db
        .cache
        .get_or_fetch(&raw_key, || async {
            let bytes = db.storage.read_bytes(&node.id).await?;
            let flakes = parse_leaf_node(&bytes)?;
            Ok(ResolvedNode::leaf(
                node.clone(),
                Arc::from(flakes.into_boxed_slice()),
            ))
        })
        .await?;

    let raw_flakes = match raw_leaf {
        ResolvedNode::Leaf { flakes, .. } => flakes,
        ResolvedNode::Branch { .. } => {
            return Err(crate::error::Error::cache(format!(
                "raw leaf cache returned branch for {}",
                node.id
            )))
        }
    };

    // Then cache the materialized version for the requested window.
    let mat_key = match from_t {
        Some(ft) => {
            CacheKey::leaf_history_range(node.id.as_str(), ft, to_t, overlay_epoch, history_mode)
        }
        None => CacheKey::leaf_t_range(node.id.as_str(), to_t, overlay_epoch, history_mode),
    };

    db.cache
        .get_or_fetch(&mat_key, || async {
            let cmp = node.index_type.comparator();
            let mut overlay_flakes = collect_overlay_flakes(overlay, node, from_t, to_t);

            // Fast path: no overlay, materialize straight off the raw leaf.
            let materialized = if overlay_flakes.is_empty() {
                materialize_raw_leaf_no_overlay(raw_flakes.as_ref(), from_t, to_t, history_mode)
            } else {
                // Overlay can supersede stored facts, so stale removal must
                // run after the merge.
                let leaf_flakes: Vec<Flake> = raw_flakes
                    .iter()
                    .filter(|f| in_time_window(f, from_t, to_t))
                    .cloned()
                    .collect();

                overlay_flakes.sort_by(cmp);

                let merged = merge_sorted(leaf_flakes, overlay_flakes, cmp);
                if history_mode {
                    merged
                } else {
                    remove_stale_flakes(merged)
                }
            };

            Ok(ResolvedNode::leaf(
                node.clone(),
                Arc::from(materialized.into_boxed_slice()),
            ))
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SimpleCache;
    use crate::codec::serialize_leaf_node;
    use crate::comparator::{cmp_spot, IndexType};
    use crate::flake::FlakeMeta;
    use crate::index::empty_root;
    use crate::overlay::NoOverlay;
    use crate::sid::Sid;
    use crate::storage::MemoryStorage;
    use crate::value::FlakeValue;

    fn make_flake(s: u16, o: i64, t: i64, op: bool) -> Flake {
        Flake::new(
            Sid::new(s, "subject"),
            Sid::new(10, "age"),
            FlakeValue::Long(o),
            Sid::new(2, "long"),
            t,
            op,
            None,
        )
    }

    #[test]
    fn test_in_time_window() {
        let f = make_flake(1, 1, 5, true);
        assert!(in_time_window(&f, None, 5));
        assert!(in_time_window(&f, None, 10));
        assert!(!in_time_window(&f, None, 4));
        assert!(in_time_window(&f, Some(5), 5));
        assert!(!in_time_window(&f, Some(6), 10));
    }

    #[test]
    fn test_stale_removal_retraction_hides_fact() {
        // Assert age=30 at t=1, retract at t=2.
        let flakes = vec![make_flake(1, 30, 1, true), make_flake(1, 30, 2, false)];
        let live = remove_stale_flakes(flakes);
        assert!(live.is_empty());
    }

    #[test]
    fn test_stale_removal_keeps_latest_assertion() {
        // Retract then re-assert: the re-assertion survives.
        let flakes = vec![
            make_flake(1, 30, 1, true),
            make_flake(1, 30, 2, false),
            make_flake(1, 30, 3, true),
        ];
        let live = remove_stale_flakes(flakes);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].t, 3);
        assert!(live[0].op);
    }

    #[test]
    fn test_stale_removal_distinct_objects_both_live() {
        // Different object values are different facts.
        let flakes = vec![make_flake(1, 30, 1, true), make_flake(1, 31, 2, true)];
        let live = remove_stale_flakes(flakes);
        assert_eq!(live.len(), 2);
    }

    #[test]
    fn test_stale_removal_distinct_meta_distinct_facts() {
        let mut a = make_flake(1, 30, 1, true);
        a.m = Some(FlakeMeta::with_lang("en"));
        let mut b = make_flake(1, 30, 2, false);
        b.m = Some(FlakeMeta::with_lang("fr"));
        // The retraction targets the "fr" fact only; "en" survives.
        let live = remove_stale_flakes(vec![a, b]);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].m.as_ref().and_then(|m| m.lang.as_deref()), Some("en"));
    }

    #[test]
    fn test_merge_sorted_interleaves() {
        let left = vec![make_flake(1, 1, 1, true), make_flake(3, 1, 1, true)];
        let right = vec![make_flake(2, 1, 1, true), make_flake(4, 1, 1, true)];
        let merged = merge_sorted(left, right, cmp_spot);
        let subjects: Vec<u16> = merged.iter().map(|f| f.s.namespace_code).collect();
        assert_eq!(subjects, vec![1, 2, 3, 4]);
    }

    struct VecOverlay {
        flakes: Vec<Flake>,
        epoch: u64,
    }

    impl OverlayProvider for VecOverlay {
        fn epoch(&self) -> u64 {
            self.epoch
        }

        fn for_each_overlay_flake(
            &self,
            _index: IndexType,
            _first: Option<&Flake>,
            _rhs: Option<&Flake>,
            _leftmost: bool,
            to_t: i64,
            callback: &mut dyn FnMut(&Flake),
        ) {
            for f in &self.flakes {
                if f.t <= to_t {
                    callback(f);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_empty_root_synthesized_from_overlay() {
        let db = Db::genesis(MemoryStorage::new(), SimpleCache::new(16), "mydb:main");
        let overlay = VecOverlay {
            flakes: vec![make_flake(2, 1, 1, true), make_flake(1, 1, 1, true)],
            epoch: 1,
        };

        let node = empty_root(IndexType::Spot);
        let resolved =
            resolve_node_materialized_with_overlay(&db, &overlay, 1, &node, None, 10, false)
                .await
                .unwrap();

        let flakes = resolved.flakes().unwrap();
        assert_eq!(flakes.len(), 2);
        // Sorted under the index comparator even though the overlay
        // yielded them out of order.
        assert_eq!(flakes[0].s.namespace_code, 1);
        // Nothing was read from storage.
        assert!(db.storage.is_empty());
    }

    #[tokio::test]
    async fn test_leaf_materialization_merges_overlay_and_removes_stale() {
        let storage = MemoryStorage::new();
        let stored = vec![make_flake(1, 30, 1, true), make_flake(2, 40, 1, true)];
        storage.insert("leaf-1", serialize_leaf_node(&stored).unwrap());

        let mut db = Db::genesis(storage, SimpleCache::new(16), "mydb:main");
        db.t = 1;
        let mut node = IndexNode::leaf("leaf-1".to_string(), IndexType::Spot);
        node.leftmost = true;

        // Overlay retracts subject 1's age and asserts a new one.
        let overlay = VecOverlay {
            flakes: vec![make_flake(1, 30, 2, false), make_flake(1, 31, 2, true)],
            epoch: 1,
        };

        let resolved =
            resolve_node_materialized_with_overlay(&db, &overlay, 1, &node, None, 2, false)
                .await
                .unwrap();
        let flakes = resolved.flakes().unwrap();
        assert_eq!(flakes.len(), 2);
        assert!(flakes
            .iter()
            .any(|f| f.s.namespace_code == 1 && f.o == FlakeValue::Long(31)));
        assert!(flakes.iter().any(|f| f.s.namespace_code == 2));

        // History mode keeps the retraction visible.
        let resolved =
            resolve_node_materialized_with_overlay(&db, &overlay, 1, &node, None, 2, true)
                .await
                .unwrap();
        assert_eq!(resolved.flakes().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_time_travel_excludes_future_flakes() {
        let storage = MemoryStorage::new();
        let stored = vec![
            make_flake(1, 30, 1, true),
            make_flake(1, 30, 3, false),
            make_flake(1, 31, 3, true),
        ];
        storage.insert("leaf-1", serialize_leaf_node(&stored).unwrap());

        let mut db = Db::genesis(storage, SimpleCache::new(16), "mydb:main");
        db.t = 3;
        let mut node = IndexNode::leaf("leaf-1".to_string(), IndexType::Spot);
        node.leftmost = true;

        // As of t=2, the retraction at t=3 has not happened.
        let resolved =
            resolve_node_materialized_with_overlay(&db, &NoOverlay, 0, &node, None, 2, false)
                .await
                .unwrap();
        let flakes = resolved.flakes().unwrap();
        assert_eq!(flakes.len(), 1);
        assert_eq!(flakes[0].o, FlakeValue::Long(30));
    }
}
