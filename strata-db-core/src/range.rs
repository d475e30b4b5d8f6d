//! Range query implementation.
//!
//! The public `range` API scans one ordering's tree between two bound
//! flakes, materializing each leaf for the requested time window. Two
//! cursor types cover streaming use: `RangeCursor` walks leaves
//! left-to-right, `MultiSeekCursor` jumps between non-contiguous sorted
//! ranges with root-to-leaf descents.

use crate::cache::NodeCache;
use crate::comparator::IndexType;
use crate::db::Db;
use crate::error::Result;
use crate::flake::{Flake, FlakeMeta};
use crate::index::{ChildRef, IndexNode, ResolvedNode};
use crate::overlay::{NoOverlay, OverlayProvider};
use crate::resolve::resolve_node_materialized_with_overlay;
use crate::sid::Sid;
use crate::storage::StorageRead;
use crate::value::FlakeValue;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};

/// Comparison test operators for range queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeTest {
    /// Equal to (becomes >= and <=)
    Eq,
    /// Less than
    Lt,
    /// Less than or equal
    Le,
    /// Greater than
    Gt,
    /// Greater than or equal
    Ge,
}

/// Components to match in a range query.
///
/// Unset components are wildcards and expand to min/max sentinels.
#[derive(Clone, Debug, Default)]
pub struct RangeMatch {
    pub s: Option<Sid>,
    pub p: Option<Sid>,
    pub o: Option<FlakeValue>,
    pub dt: Option<Sid>,
    pub t: Option<i64>,
}

impl RangeMatch {
    /// Create an empty match (matches everything).
    pub fn new() -> Self {
        Self::default()
    }

    /// Match a specific subject.
    pub fn subject(s: Sid) -> Self {
        Self {
            s: Some(s),
            ..Default::default()
        }
    }

    /// Match a specific subject and predicate.
    pub fn subject_predicate(s: Sid, p: Sid) -> Self {
        Self {
            s: Some(s),
            p: Some(p),
            ..Default::default()
        }
    }

    /// Match a specific predicate.
    pub fn predicate(p: Sid) -> Self {
        Self {
            p: Some(p),
            ..Default::default()
        }
    }

    /// Match a specific predicate and object.
    pub fn predicate_object(p: Sid, o: FlakeValue) -> Self {
        Self {
            p: Some(p),
            o: Some(o),
            ..Default::default()
        }
    }

    /// Match a specific transaction time (for the t-first ordering).
    pub fn at_t(t: i64) -> Self {
        Self {
            t: Some(t),
            ..Default::default()
        }
    }

    pub fn with_subject(mut self, s: Sid) -> Self {
        self.s = Some(s);
        self
    }

    pub fn with_predicate(mut self, p: Sid) -> Self {
        self.p = Some(p);
        self
    }

    pub fn with_object(mut self, o: FlakeValue) -> Self {
        self.o = Some(o);
        self
    }

    pub fn with_datatype(mut self, dt: Sid) -> Self {
        self.dt = Some(dt);
        self
    }

    pub fn with_t(mut self, t: i64) -> Self {
        self.t = Some(t);
        self
    }
}

/// Object value bounds for range filtering.
///
/// Used for filter pushdown to narrow scan results by object value.
/// Applied as a post-filter after the range scan; on the
/// predicate-object ordering the bounds are also baked into the seek
/// flakes so the tree skips irrelevant nodes.
#[derive(Clone, Debug, Default)]
pub struct ObjectBounds {
    /// Lower bound: (value, inclusive).
    pub lower: Option<(FlakeValue, bool)>,
    /// Upper bound: (value, inclusive).
    pub upper: Option<(FlakeValue, bool)>,
}

impl ObjectBounds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lower(mut self, value: FlakeValue, inclusive: bool) -> Self {
        self.lower = Some((value, inclusive));
        self
    }

    pub fn with_upper(mut self, value: FlakeValue, inclusive: bool) -> Self {
        self.upper = Some((value, inclusive));
        self
    }

    /// Check if a value satisfies the bounds.
    ///
    /// Numeric values compare across representations: a `Long(10)` lower
    /// bound admits `Double(15.5)`. Non-numeric values require the same
    /// variant; mismatched classes never match.
    pub fn matches(&self, value: &FlakeValue) -> bool {
        if let Some((lower, inclusive)) = &self.lower {
            match Self::class_cmp(value, lower) {
                None => return false,
                Some(std::cmp::Ordering::Less) => return false,
                Some(std::cmp::Ordering::Equal) if !inclusive => return false,
                _ => {}
            }
        }

        if let Some((upper, inclusive)) = &self.upper {
            match Self::class_cmp(value, upper) {
                None => return false,
                Some(std::cmp::Ordering::Greater) => return false,
                Some(std::cmp::Ordering::Equal) if !inclusive => return false,
                _ => {}
            }
        }

        true
    }

    /// Compare values within their type class; `None` means incomparable.
    fn class_cmp(a: &FlakeValue, b: &FlakeValue) -> Option<std::cmp::Ordering> {
        if a.is_numeric() && b.is_numeric() {
            return a.numeric_cmp(b);
        }
        if std::mem::discriminant(a) == std::mem::discriminant(b) {
            return Some(a.cmp(b));
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }
}

/// Default number of leaves to prefetch ahead during cold scans.
///
/// Larger values risk too many concurrent reads on cold storage.
pub const DEFAULT_PREFETCH_N: usize = 3;

/// Options for range query execution.
#[derive(Clone, Debug, Default)]
pub struct RangeOptions {
    /// Maximum number of subjects to return.
    pub limit: Option<usize>,
    /// Number of subjects to skip.
    pub offset: Option<usize>,
    /// Maximum number of flakes to return.
    pub flake_limit: Option<usize>,
    /// "As-of" time; only flakes with t <= to_t are included.
    /// `None` uses the database's current t.
    pub to_t: Option<i64>,
    /// Start time for history queries; only flakes with t >= from_t.
    pub from_t: Option<i64>,
    /// Optional object value bounds (filter pushdown).
    pub object_bounds: Option<ObjectBounds>,
    /// History mode: skip stale removal and return retractions too.
    pub history_mode: bool,
    /// Leaves to prefetch ahead of the traversal. 0 disables.
    pub prefetch_n: Option<usize>,
}

impl RangeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_flake_limit(mut self, flake_limit: usize) -> Self {
        self.flake_limit = Some(flake_limit);
        self
    }

    /// Set the "as-of" time for time travel queries.
    pub fn with_to_t(mut self, to_t: i64) -> Self {
        self.to_t = Some(to_t);
        self
    }

    /// Set the start time for history queries.
    pub fn with_from_t(mut self, from_t: i64) -> Self {
        self.from_t = Some(from_t);
        self
    }

    /// Set both ends of a time window.
    pub fn with_time_range(mut self, from_t: i64, to_t: i64) -> Self {
        self.from_t = Some(from_t);
        self.to_t = Some(to_t);
        self
    }

    pub fn with_object_bounds(mut self, bounds: ObjectBounds) -> Self {
        self.object_bounds = Some(bounds);
        self
    }

    /// Enable history mode: no stale removal, retractions included.
    pub fn with_history_mode(mut self) -> Self {
        self.history_mode = true;
        self
    }

    pub fn with_prefetch_n(mut self, n: usize) -> Self {
        self.prefetch_n = Some(n);
        self
    }

    pub fn without_prefetch(mut self) -> Self {
        self.prefetch_n = Some(0);
        self
    }
}

/// Execute a range query against the persisted indexes only.
///
/// Returns flakes matching the query criteria in index order.
pub async fn range<S, C>(
    db: &Db<S, C>,
    index: IndexType,
    test: RangeTest,
    match_val: RangeMatch,
    opts: RangeOptions,
) -> Result<Vec<Flake>>
where
    S: StorageRead,
    C: NodeCache,
{
    range_with_overlay(db, &NoOverlay, index, test, match_val, opts).await
}

/// Execute a range query with an overlay provider (novelty).
///
/// The overlay is merged at leaf materialization time and its epoch is
/// part of the materialization cache key, so stale results cannot leak
/// across commits.
pub async fn range_with_overlay<S, C, O>(
    db: &Db<S, C>,
    overlay: &O,
    index: IndexType,
    test: RangeTest,
    match_val: RangeMatch,
    opts: RangeOptions,
) -> Result<Vec<Flake>>
where
    S: StorageRead,
    C: NodeCache,
    O: OverlayProvider + ?Sized,
{
    let (mut start_bound, mut end_bound) = expand_range_bounds(index, test, &match_val);

    // On the predicate-object ordering, bake object bounds into the seek
    // flakes so the tree can skip nodes instead of post-filtering alone.
    if index == IndexType::Post {
        if let Some(ref bounds) = opts.object_bounds {
            apply_object_bounds_to_flakes(&mut start_bound, &mut end_bound, bounds);
        }
    }

    range_bounded_with_overlay(db, overlay, index, start_bound, end_bound, opts).await
}

/// Execute a bounded range query with explicit start and end flakes.
///
/// Useful for scans between two different subjects (e.g. prefix scans)
/// that a single `RangeMatch` cannot express.
pub async fn range_bounded_with_overlay<S, C, O>(
    db: &Db<S, C>,
    overlay: &O,
    index: IndexType,
    start_bound: Flake,
    end_bound: Flake,
    opts: RangeOptions,
) -> Result<Vec<Flake>>
where
    S: StorageRead,
    C: NodeCache,
    O: OverlayProvider + ?Sized,
{
    let to_t = opts.to_t.unwrap_or(db.t);
    let from_t = opts.from_t;
    let prefetch_n = opts.prefetch_n.unwrap_or(DEFAULT_PREFETCH_N);

    let root = db.get_index_root(index)?;
    let cmp = index.comparator();
    let overlay_epoch = overlay.epoch();

    let mut results = Vec::new();
    let mut stack = vec![root];
    let mut prefetches: FuturesUnordered<BoxFuture<'_, ()>> = FuturesUnordered::new();

    while let Some(node) = stack.pop() {
        if !node.intersects_range(&start_bound, &end_bound) {
            continue;
        }

        let mut resolved_fut = resolve_node_materialized_with_overlay(
            db,
            overlay,
            overlay_epoch,
            &node,
            from_t,
            to_t,
            opts.history_mode,
        )
        .boxed()
        .fuse();

        // Drive queued prefetches while awaiting the mainline resolve.
        let resolved = loop {
            if prefetches.is_empty() {
                break resolved_fut.await?;
            }
            futures::select! {
                res = resolved_fut => break res?,
                _ = prefetches.next().fuse() => {}
            }
        };

        match resolved {
            ResolvedNode::Leaf { flakes, .. } => {
                if prefetch_n > 0 {
                    prefetch_upcoming_leaves(
                        &mut prefetches,
                        db,
                        overlay,
                        overlay_epoch,
                        &stack,
                        &start_bound,
                        &end_bound,
                        from_t,
                        to_t,
                        opts.history_mode,
                        prefetch_n,
                    );
                }

                let trimmed = trim_to_range(flakes.as_ref(), &start_bound, &end_bound, cmp);

                for flake in trimmed {
                    if let Some(ref bounds) = opts.object_bounds {
                        if !bounds.matches(&flake.o) {
                            continue;
                        }
                    }

                    results.push(flake.clone());
                    if let Some(limit) = opts.flake_limit {
                        if results.len() >= limit {
                            return Ok(results);
                        }
                    }
                }
            }
            ResolvedNode::Branch {
                children,
                node: branch_node,
            } => {
                let filtered: Vec<_> = children
                    .iter()
                    .filter(|c| c.intersects_range(&start_bound, &end_bound, cmp))
                    .map(|c| IndexNode::from_child_ref(c, index, branch_node.t))
                    .collect();

                // Push in reverse so traversal runs left-to-right.
                stack.extend(filtered.into_iter().rev());

                if prefetch_n > 0 {
                    prefetch_upcoming_leaves(
                        &mut prefetches,
                        db,
                        overlay,
                        overlay_epoch,
                        &stack,
                        &start_bound,
                        &end_bound,
                        from_t,
                        to_t,
                        opts.history_mode,
                        prefetch_n,
                    );
                }
            }
        }
    }

    if opts.limit.is_some() || opts.offset.is_some() {
        results = apply_subject_pagination(results, opts.offset, opts.limit);
    }

    Ok(results)
}

/// Queue resolution futures for upcoming nodes so I/O overlaps traversal.
///
/// Queued futures are not spawned; they are driven opportunistically while
/// the caller awaits its mainline resolve. Cache deduplication means that
/// if the mainline reaches a node first, the prefetch waits on the same
/// in-flight fetch instead of duplicating it. Errors are swallowed here;
/// the mainline will surface them when it reaches the node.
#[allow(clippy::too_many_arguments)]
fn prefetch_upcoming_leaves<'a, S, C, O>(
    prefetches: &mut FuturesUnordered<BoxFuture<'a, ()>>,
    db: &'a Db<S, C>,
    overlay: &'a O,
    overlay_epoch: u64,
    stack: &[IndexNode],
    start_bound: &Flake,
    end_bound: &Flake,
    from_t: Option<i64>,
    to_t: i64,
    history_mode: bool,
    n: usize,
) -> usize
where
    S: StorageRead,
    C: NodeCache,
    O: OverlayProvider + ?Sized,
{
    let nodes = prefetch_candidates_from_stack(stack, start_bound, end_bound, n);
    let count = nodes.len();

    for node in nodes {
        prefetches.push(
            async move {
                let _ = resolve_node_materialized_with_overlay(
                    db,
                    overlay,
                    overlay_epoch,
                    &node,
                    from_t,
                    to_t,
                    history_mode,
                )
                .await;
            }
            .boxed(),
        );
    }

    count
}

/// Collect up to `n` stack nodes worth prefetching, leaves before branches.
fn prefetch_candidates_from_stack(
    stack: &[IndexNode],
    start_bound: &Flake,
    end_bound: &Flake,
    n: usize,
) -> Vec<IndexNode> {
    let mut nodes = Vec::with_capacity(n);

    for node in stack.iter().rev().filter(|n| n.leaf) {
        if nodes.len() >= n {
            break;
        }
        if node.intersects_range(start_bound, end_bound) {
            nodes.push(node.clone());
        }
    }
    for node in stack.iter().rev().filter(|n| !n.leaf) {
        if nodes.len() >= n {
            break;
        }
        if node.intersects_range(start_bound, end_bound) {
            nodes.push(node.clone());
        }
    }

    nodes
}

/// Expand a test into inclusive start/end bound flakes.
fn expand_range_bounds(
    index: IndexType,
    test: RangeTest,
    match_val: &RangeMatch,
) -> (Flake, Flake) {
    let start_bound = match_to_flake(index, match_val, true);
    let end_bound = match_to_flake(index, match_val, false);

    match test {
        RangeTest::Eq => (start_bound, end_bound),
        RangeTest::Lt => (Flake::min_sentinel(), start_bound),
        RangeTest::Le => (Flake::min_sentinel(), end_bound),
        RangeTest::Gt => (end_bound, Flake::max_sentinel()),
        RangeTest::Ge => (start_bound, Flake::max_sentinel()),
    }
}

/// Nudge exclusive double bounds by one ULP so inclusive tree seeks skip
/// the exact boundary value. Non-double or inclusive bounds pass through.
fn adjust_exclusive_bound(val: &FlakeValue, inclusive: bool, is_lower: bool) -> FlakeValue {
    if inclusive {
        return val.clone();
    }
    match val {
        FlakeValue::Double(d) => {
            let adjusted = if is_lower {
                next_up_f64(*d)
            } else {
                next_down_f64(*d)
            };
            FlakeValue::Double(adjusted)
        }
        _ => val.clone(),
    }
}

/// Bake object bounds into start/end flakes for predicate-object seeks.
fn apply_object_bounds_to_flakes(start: &mut Flake, end: &mut Flake, bounds: &ObjectBounds) {
    if let Some((lower_val, inclusive)) = &bounds.lower {
        start.o = adjust_exclusive_bound(lower_val, *inclusive, true);
    }
    if let Some((upper_val, inclusive)) = &bounds.upper {
        end.o = adjust_exclusive_bound(upper_val, *inclusive, false);
    }
}

/// Convert a match to a bound flake; unset components become min or max
/// sentinels depending on which end this is.
fn match_to_flake(_index: IndexType, match_val: &RangeMatch, is_start: bool) -> Flake {
    let (s, p, o, dt, t) = if is_start {
        (
            match_val.s.clone().unwrap_or_else(Sid::min),
            match_val.p.clone().unwrap_or_else(Sid::min),
            match_val.o.clone().unwrap_or_else(FlakeValue::min),
            match_val.dt.clone().unwrap_or_else(Sid::min),
            match_val.t.unwrap_or(i64::MIN),
        )
    } else {
        (
            match_val.s.clone().unwrap_or_else(Sid::max),
            match_val.p.clone().unwrap_or_else(Sid::max),
            match_val.o.clone().unwrap_or_else(FlakeValue::max),
            match_val.dt.clone().unwrap_or_else(Sid::max),
            match_val.t.unwrap_or(i64::MAX),
        )
    };

    let (op, m) = if is_start {
        (false, Some(FlakeMeta::min()))
    } else {
        (true, Some(FlakeMeta::max()))
    };

    Flake::new(s, p, o, dt, t, op, m)
}

/// Next representable f64 above `x` (stable stand-in for `f64::next_up`).
fn next_up_f64(x: f64) -> f64 {
    if x.is_nan() || x == f64::INFINITY {
        return x;
    }
    if x == f64::NEG_INFINITY {
        return f64::MIN;
    }
    if x == 0.0 {
        return f64::from_bits(1);
    }

    let bits = x.to_bits();
    let next_bits = if x > 0.0 { bits + 1 } else { bits - 1 };
    f64::from_bits(next_bits)
}

/// Next representable f64 below `x`.
fn next_down_f64(x: f64) -> f64 {
    if x.is_nan() || x == f64::NEG_INFINITY {
        return x;
    }
    if x == f64::INFINITY {
        return f64::MAX;
    }
    if x == 0.0 {
        return -f64::from_bits(1);
    }

    let bits = x.to_bits();
    let next_bits = if x > 0.0 { bits - 1 } else { bits + 1 };
    f64::from_bits(next_bits)
}

/// Trim sorted flakes to `[start, end]` with two binary searches.
fn trim_to_range<'a>(
    flakes: &'a [Flake],
    start: &Flake,
    end: &Flake,
    cmp: fn(&Flake, &Flake) -> std::cmp::Ordering,
) -> &'a [Flake] {
    if flakes.is_empty() {
        return flakes;
    }

    let start_idx = flakes.partition_point(|f| cmp(f, start) == std::cmp::Ordering::Less);
    let end_idx = flakes.partition_point(|f| cmp(f, end) != std::cmp::Ordering::Greater);

    if start_idx >= end_idx {
        return &flakes[0..0];
    }
    &flakes[start_idx..end_idx]
}

/// Apply subject-based pagination: offset and limit count distinct
/// subjects, not flakes.
fn apply_subject_pagination(
    flakes: Vec<Flake>,
    offset: Option<usize>,
    limit: Option<usize>,
) -> Vec<Flake> {
    if offset.is_none() && limit.is_none() {
        return flakes;
    }

    let mut result = Vec::new();
    let mut current_subject: Option<Sid> = None;
    let mut subject_count = 0;
    let offset = offset.unwrap_or(0);
    let limit = limit.unwrap_or(usize::MAX);

    for flake in flakes {
        let is_new_subject = current_subject
            .as_ref()
            .map(|s| s != &flake.s)
            .unwrap_or(true);

        if is_new_subject {
            subject_count += 1;
            current_subject = Some(flake.s.clone());
        }

        if subject_count <= offset {
            continue;
        }
        if subject_count > offset + limit {
            break;
        }

        result.push(flake);
    }

    result
}

// ============================================================================
// RangeCursor: stateful iterator for chunked tree traversal
// ============================================================================

/// A stateful cursor yielding index flakes one leaf at a time.
///
/// Encapsulates tree traversal state so callers can stream large scans
/// with memory bounded by one leaf plus the stack, regardless of result
/// size. Creation performs no I/O.
///
/// The cursor does not apply `limit`/`offset`/`flake_limit`; callers that
/// stream decide their own stopping point.
pub struct RangeCursor {
    /// Traversal stack (nodes still to visit).
    stack: Vec<IndexNode>,
    /// Start bound (inclusive).
    start_bound: Flake,
    /// End bound (inclusive).
    end_bound: Flake,
    cmp: fn(&Flake, &Flake) -> std::cmp::Ordering,
    index: IndexType,
    to_t: i64,
    from_t: Option<i64>,
    history_mode: bool,
    object_bounds: Option<ObjectBounds>,
    exhausted: bool,
    prefetch_n: usize,
    /// Nodes to prefetch at the start of the next `next_leaf()` call.
    ///
    /// Stored as nodes rather than live futures to avoid borrowing `self`
    /// across calls. If a queued prefetch is orphaned mid-flight, the
    /// cache retries on the next request for that node.
    pending_prefetch_nodes: Vec<IndexNode>,
}

impl RangeCursor {
    /// Create a cursor from a test and match. No I/O happens here.
    pub fn new<S, C>(
        db: &Db<S, C>,
        index: IndexType,
        test: RangeTest,
        match_val: RangeMatch,
        opts: RangeOptions,
    ) -> Result<Self>
    where
        S: StorageRead,
        C: NodeCache,
    {
        let (mut start_bound, mut end_bound) = expand_range_bounds(index, test, &match_val);

        if index == IndexType::Post {
            if let Some(ref bounds) = opts.object_bounds {
                apply_object_bounds_to_flakes(&mut start_bound, &mut end_bound, bounds);
            }
        }

        Self::new_bounded(db, index, start_bound, end_bound, opts)
    }

    /// Create a cursor with explicit start and end bounds.
    pub fn new_bounded<S, C>(
        db: &Db<S, C>,
        index: IndexType,
        start_bound: Flake,
        end_bound: Flake,
        opts: RangeOptions,
    ) -> Result<Self>
    where
        S: StorageRead,
        C: NodeCache,
    {
        let to_t = opts.to_t.unwrap_or(db.t);
        let root = db.get_index_root(index)?;

        Ok(Self {
            stack: vec![root],
            start_bound,
            end_bound,
            cmp: index.comparator(),
            index,
            to_t,
            from_t: opts.from_t,
            history_mode: opts.history_mode,
            object_bounds: opts.object_bounds,
            exhausted: false,
            prefetch_n: opts.prefetch_n.unwrap_or(DEFAULT_PREFETCH_N),
            pending_prefetch_nodes: Vec::new(),
        })
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Get the next leaf's worth of flakes.
    ///
    /// Returns `Ok(Some(flakes))` for the next non-empty leaf in traversal
    /// order, `Ok(None)` once exhausted. Returned flakes are already
    /// time-filtered, overlay-merged, stale-removed (unless history mode),
    /// trimmed to the bounds, and object-bound filtered.
    pub async fn next_leaf<S, C, O>(
        &mut self,
        db: &Db<S, C>,
        overlay: &O,
    ) -> Result<Option<Vec<Flake>>>
    where
        S: StorageRead,
        C: NodeCache,
        O: OverlayProvider + ?Sized,
    {
        if self.exhausted {
            return Ok(None);
        }

        let overlay_epoch = overlay.epoch();

        // Copy time fields to locals so the async blocks below don't
        // capture `self` while it is mutably borrowed.
        let from_t = self.from_t;
        let to_t = self.to_t;
        let history_mode = self.history_mode;

        let mut prefetches: FuturesUnordered<BoxFuture<'_, ()>> = FuturesUnordered::new();

        // Fire prefetch saved from the previous call. Orphaned fetches are
        // retried by the cache on the next request for that node.
        if self.prefetch_n > 0 && !self.pending_prefetch_nodes.is_empty() {
            for node in self.pending_prefetch_nodes.drain(..) {
                prefetches.push(
                    async move {
                        let _ = resolve_node_materialized_with_overlay(
                            db,
                            overlay,
                            overlay_epoch,
                            &node,
                            from_t,
                            to_t,
                            history_mode,
                        )
                        .await;
                    }
                    .boxed(),
                );
            }
        }

        while let Some(node) = self.stack.pop() {
            if !node.intersects_range(&self.start_bound, &self.end_bound) {
                continue;
            }

            let mut resolved_fut = resolve_node_materialized_with_overlay(
                db,
                overlay,
                overlay_epoch,
                &node,
                from_t,
                to_t,
                history_mode,
            )
            .boxed()
            .fuse();

            let resolved = loop {
                if prefetches.is_empty() {
                    break resolved_fut.await?;
                }
                futures::select! {
                    res = resolved_fut => break res?,
                    _ = prefetches.next().fuse() => {}
                }
            };

            match resolved {
                ResolvedNode::Leaf { flakes, .. } => {
                    let trimmed = trim_to_range(
                        flakes.as_ref(),
                        &self.start_bound,
                        &self.end_bound,
                        self.cmp,
                    );

                    let result: Vec<Flake> = if let Some(ref bounds) = self.object_bounds {
                        trimmed
                            .iter()
                            .filter(|f| bounds.matches(&f.o))
                            .cloned()
                            .collect()
                    } else {
                        trimmed.to_vec()
                    };

                    if !result.is_empty() {
                        // Save prefetch candidates instead of firing futures
                        // here; firing them at the start of the next call
                        // gives them the whole call to complete.
                        if self.prefetch_n > 0 {
                            self.pending_prefetch_nodes = self.prefetch_candidates();
                        }
                        return Ok(Some(result));
                    }
                    // Empty leaf after filtering; keep walking.
                }
                ResolvedNode::Branch {
                    children,
                    node: branch_node,
                } => {
                    let filtered: Vec<_> = children
                        .iter()
                        .filter(|c| {
                            c.intersects_range(&self.start_bound, &self.end_bound, self.cmp)
                        })
                        .map(|c| IndexNode::from_child_ref(c, self.index, branch_node.t))
                        .collect();

                    stack_extend_reversed(&mut self.stack, filtered);
                }
            }
        }

        self.exhausted = true;
        Ok(None)
    }

    /// Nodes on the stack worth prefetching next, leaves first.
    pub fn prefetch_candidates(&self) -> Vec<IndexNode> {
        prefetch_candidates_from_stack(
            &self.stack,
            &self.start_bound,
            &self.end_bound,
            self.prefetch_n,
        )
    }

    /// Drain the cursor into a single vector.
    ///
    /// Convenience for callers with modest result sets; large scans should
    /// iterate `next_leaf()` instead.
    pub async fn collect_all<S, C, O>(&mut self, db: &Db<S, C>, overlay: &O) -> Result<Vec<Flake>>
    where
        S: StorageRead,
        C: NodeCache,
        O: OverlayProvider + ?Sized,
    {
        let mut results = Vec::new();
        while let Some(leaf_flakes) = self.next_leaf(db, overlay).await? {
            results.extend(leaf_flakes);
        }
        Ok(results)
    }
}

fn stack_extend_reversed(stack: &mut Vec<IndexNode>, nodes: Vec<IndexNode>) {
    stack.extend(nodes.into_iter().rev());
}

// ============================================================================
// MultiSeekCursor: sorted multi-range lookups via root-to-leaf seeks
// ============================================================================

/// State of a resolved leaf during multi-seek traversal.
struct LeafState {
    /// Materialized flakes (time-filtered, overlay-merged, stale-removed).
    flakes: Vec<Flake>,
    /// Current scan position.
    pos: usize,
    /// Right-hand boundary of this leaf, for the next seek target.
    rhs: Option<Flake>,
}

/// A cursor that seeks through multiple sorted, non-contiguous ranges
/// using explicit root-to-leaf descents.
///
/// Where `RangeCursor` walks every leaf left-to-right, this cursor
/// descends from the root for each new range and skips everything in
/// between. Branches are cached raw, so repeated descents are cheap;
/// only leaf resolution touches storage. A leaf that spans into the next
/// range is buffered, so adjacent ranges never resolve it twice.
pub struct MultiSeekCursor {
    /// Ranges to visit, pre-sorted by start bound under the comparator.
    ranges: Vec<(Flake, Flake)>,
    current_range: usize,
    root: IndexNode,
    cmp: fn(&Flake, &Flake) -> std::cmp::Ordering,
    index: IndexType,
    to_t: i64,
    from_t: Option<i64>,
    history_mode: bool,
    /// Buffered leaf from the last seek (may span into the next range).
    current_leaf: Option<LeafState>,
}

impl MultiSeekCursor {
    /// Create a multi-seek cursor.
    ///
    /// `ranges` must be pre-sorted by start bound using the index
    /// comparator; ordering is not validated.
    pub fn new<S, C>(
        db: &Db<S, C>,
        index: IndexType,
        ranges: Vec<(Flake, Flake)>,
        opts: RangeOptions,
    ) -> Result<Self>
    where
        S: StorageRead,
        C: NodeCache,
    {
        let to_t = opts.to_t.unwrap_or(db.t);
        let root = db.get_index_root(index)?;

        Ok(Self {
            ranges,
            current_range: 0,
            root,
            cmp: index.comparator(),
            index,
            to_t,
            from_t: opts.from_t,
            history_mode: opts.history_mode,
            current_leaf: None,
        })
    }

    /// 0-based index of the range whose flakes were just returned. Valid
    /// after a `next_range_flakes()` call that returned `Some`.
    pub fn last_range_index(&self) -> usize {
        self.current_range.saturating_sub(1)
    }

    /// Get flakes for the next range.
    ///
    /// Returns `Ok(Some(flakes))` for each range in order (possibly
    /// empty), `Ok(None)` when all ranges are exhausted.
    pub async fn next_range_flakes<S, C, O>(
        &mut self,
        db: &Db<S, C>,
        overlay: &O,
    ) -> Result<Option<Vec<Flake>>>
    where
        S: StorageRead,
        C: NodeCache,
        O: OverlayProvider + ?Sized,
    {
        if self.current_range >= self.ranges.len() {
            return Ok(None);
        }

        let mut result = Vec::new();

        // Phase 1: drain any buffered leaf from a previous range.
        let mut need_seek_after_rhs: Option<Flake> = None;

        if let Some(ref mut leaf) = self.current_leaf {
            let (start, end) = &self.ranges[self.current_range];
            Self::drain_matching_flakes(leaf, start, end, self.cmp, &mut result);

            if leaf.pos < leaf.flakes.len() {
                // Leaf still has flakes past `end`: range complete.
                self.current_range += 1;
                return Ok(Some(result));
            }

            match &leaf.rhs {
                Some(rhs) => {
                    let (_, end) = &self.ranges[self.current_range];
                    if (self.cmp)(rhs, end) >= std::cmp::Ordering::Equal {
                        // Leaf covers through the end of this range.
                        self.current_leaf = None;
                        self.current_range += 1;
                        return Ok(Some(result));
                    }
                    need_seek_after_rhs = Some(rhs.clone());
                }
                None => {
                    // Rightmost leaf, nothing further anywhere.
                    self.current_leaf = None;
                    self.current_range += 1;
                    return Ok(Some(result));
                }
            }
        }
        self.current_leaf = None;

        // Phase 2: seek loop.
        let overlay_epoch = overlay.epoch();
        let (start, end) = self.ranges[self.current_range].clone();

        let (mut seek_target, mut after) = match need_seek_after_rhs {
            Some(rhs) => (rhs, true),
            None => (start.clone(), false),
        };

        loop {
            let leaf = Self::seek_leaf(
                &self.root,
                &seek_target,
                after,
                self.cmp,
                self.index,
                db,
                overlay,
                overlay_epoch,
                self.to_t,
                self.from_t,
                self.history_mode,
            )
            .await?;

            let mut leaf = match leaf {
                Some(l) => l,
                None => break, // past end of index
            };

            Self::drain_matching_flakes(&mut leaf, &start, &end, self.cmp, &mut result);

            if leaf.pos < leaf.flakes.len() {
                // Flakes past `end` remain: range complete, buffer the
                // leaf for the next range.
                self.current_leaf = Some(leaf);
                break;
            }

            match &leaf.rhs {
                None => break,
                Some(rhs) if (self.cmp)(rhs, &end) >= std::cmp::Ordering::Equal => break,
                Some(rhs) => {
                    // Range spans beyond this leaf.
                    seek_target = rhs.clone();
                    after = true;
                }
            }
        }

        self.current_range += 1;
        Ok(Some(result))
    }

    /// Drain flakes in `[start, end]` from `leaf` into `result`, advancing
    /// `leaf.pos` past consumed flakes. Stops without advancing at the
    /// first flake beyond `end`.
    fn drain_matching_flakes(
        leaf: &mut LeafState,
        start: &Flake,
        end: &Flake,
        cmp: fn(&Flake, &Flake) -> std::cmp::Ordering,
        result: &mut Vec<Flake>,
    ) {
        while leaf.pos < leaf.flakes.len() {
            let f = &leaf.flakes[leaf.pos];
            if cmp(f, start) == std::cmp::Ordering::Less {
                leaf.pos += 1;
                continue;
            }
            if cmp(f, end) == std::cmp::Ordering::Greater {
                break;
            }
            result.push(f.clone());
            leaf.pos += 1;
        }
    }

    /// Seek from root to the leaf containing (or just after) `target`.
    ///
    /// With `after` set, seeks to the leaf **after** the one whose `rhs`
    /// equals `target`, preventing a stall when continuing past a leaf
    /// boundary.
    #[allow(clippy::too_many_arguments)]
    async fn seek_leaf<S, C, O>(
        root: &IndexNode,
        target: &Flake,
        after: bool,
        cmp: fn(&Flake, &Flake) -> std::cmp::Ordering,
        index: IndexType,
        db: &Db<S, C>,
        overlay: &O,
        overlay_epoch: u64,
        to_t: i64,
        from_t: Option<i64>,
        history_mode: bool,
    ) -> Result<Option<LeafState>>
    where
        S: StorageRead,
        C: NodeCache,
        O: OverlayProvider + ?Sized,
    {
        let mut current_node = root.clone();

        loop {
            let resolved = resolve_node_materialized_with_overlay(
                db,
                overlay,
                overlay_epoch,
                &current_node,
                from_t,
                to_t,
                history_mode,
            )
            .await?;

            match resolved {
                ResolvedNode::Branch {
                    children,
                    node: branch_node,
                } => match Self::floor_child(&children, target, after, cmp) {
                    Some(child) => {
                        current_node = IndexNode::from_child_ref(child, index, branch_node.t);
                    }
                    None => return Ok(None),
                },
                ResolvedNode::Leaf {
                    flakes,
                    node: leaf_node,
                } => {
                    return Ok(Some(LeafState {
                        flakes: flakes.to_vec(),
                        pos: 0,
                        rhs: leaf_node.rhs.clone(),
                    }));
                }
            }
        }
    }

    /// Find the child whose window should contain `target`.
    ///
    /// Gap-safe floor search: binary-search the last child whose `first <=
    /// target`, then advance one child when the selection's `rhs` falls
    /// short of the target (`rhs < target` normally, `rhs <= target` in
    /// after mode). `rhs == None` acts as positive infinity.
    fn floor_child<'a>(
        children: &'a [ChildRef],
        target: &Flake,
        after: bool,
        cmp: fn(&Flake, &Flake) -> std::cmp::Ordering,
    ) -> Option<&'a ChildRef> {
        if children.is_empty() {
            return None;
        }

        let pp = children.partition_point(|child| match &child.first {
            None => true,
            Some(_) if child.leftmost => true,
            Some(first) => cmp(first, target) != std::cmp::Ordering::Greater,
        });

        let mut idx = if pp == 0 { 0 } else { pp - 1 };

        if let Some(ref rhs) = children[idx].rhs {
            let ord = cmp(rhs, target);
            let should_advance = if after {
                ord != std::cmp::Ordering::Greater
            } else {
                ord == std::cmp::Ordering::Less
            };

            if should_advance {
                idx += 1;
                if idx >= children.len() {
                    return None;
                }
            }
        }

        Some(&children[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SimpleCache;
    use crate::codec::{serialize_branch_node, serialize_leaf_node};
    use crate::comparator::cmp_spot;
    use crate::storage::MemoryStorage;

    fn make_flake(s: u16, p: u16, o: i64, t: i64) -> Flake {
        Flake::new(
            Sid::new(s, "s"),
            Sid::new(p, "p"),
            FlakeValue::Long(o),
            Sid::new(2, "long"),
            t,
            true,
            None,
        )
    }

    #[test]
    fn test_range_match_builders() {
        let s = Sid::new(1, "test");
        let p = Sid::new(2, "prop");

        let m1 = RangeMatch::subject(s.clone());
        assert_eq!(m1.s, Some(s.clone()));
        assert!(m1.p.is_none());

        let m2 = RangeMatch::subject_predicate(s.clone(), p.clone());
        assert_eq!(m2.s, Some(s));
        assert_eq!(m2.p, Some(p));

        let m3 = RangeMatch::at_t(7);
        assert_eq!(m3.t, Some(7));
    }

    #[test]
    fn test_trim_to_range() {
        let flakes: Vec<_> = (0..10).map(|s| make_flake(s, 1, 1, 1)).collect();
        let start = make_flake(3, 1, 1, 1);
        let end = make_flake(7, 1, 1, 1);

        let trimmed = trim_to_range(&flakes, &start, &end, cmp_spot);
        assert_eq!(trimmed.len(), 5);
        assert_eq!(trimmed[0].s.namespace_code, 3);
        assert_eq!(trimmed[4].s.namespace_code, 7);
    }

    #[test]
    fn test_subject_pagination() {
        // 3 subjects, 2 flakes each
        let flakes = vec![
            make_flake(1, 1, 1, 1),
            make_flake(1, 2, 1, 1),
            make_flake(2, 1, 1, 1),
            make_flake(2, 2, 1, 1),
            make_flake(3, 1, 1, 1),
            make_flake(3, 2, 1, 1),
        ];

        // Offset 1, limit 1 yields subject 2 only.
        let result = apply_subject_pagination(flakes.clone(), Some(1), Some(1));
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].s.namespace_code, 2);

        let result = apply_subject_pagination(flakes.clone(), None, None);
        assert_eq!(result.len(), 6);
    }

    #[test]
    fn test_object_bounds_matches() {
        let bounds = ObjectBounds::new().with_lower(FlakeValue::Long(10), true);
        assert!(!bounds.matches(&FlakeValue::Long(9)));
        assert!(bounds.matches(&FlakeValue::Long(10)));
        assert!(bounds.matches(&FlakeValue::Long(11)));

        let bounds = ObjectBounds::new().with_lower(FlakeValue::Long(10), false);
        assert!(!bounds.matches(&FlakeValue::Long(10)));
        assert!(bounds.matches(&FlakeValue::Long(11)));

        let bounds = ObjectBounds::new().with_upper(FlakeValue::Long(100), false);
        assert!(bounds.matches(&FlakeValue::Long(99)));
        assert!(!bounds.matches(&FlakeValue::Long(100)));
    }

    #[test]
    fn test_object_bounds_numeric_class() {
        // Long bounds admit Double values and vice versa.
        let bounds = ObjectBounds::new().with_lower(FlakeValue::Long(3), false);
        assert!(bounds.matches(&FlakeValue::Double(3.5)));
        assert!(bounds.matches(&FlakeValue::Long(4)));
        assert!(!bounds.matches(&FlakeValue::Double(3.0)));
        assert!(!bounds.matches(&FlakeValue::Long(3)));

        // Mismatched classes never match.
        assert!(!bounds.matches(&FlakeValue::String("hello".to_string())));
    }

    #[test]
    fn test_next_up_down_f64() {
        assert!(next_up_f64(1.0) > 1.0);
        assert!(next_down_f64(1.0) < 1.0);
        assert!(next_up_f64(0.0) > 0.0);
        assert!(next_down_f64(0.0) < 0.0);
        assert!(next_up_f64(-1.0) > -1.0);
        assert!(next_up_f64(f64::NAN).is_nan());
    }

    #[test]
    fn test_floor_child_gap_safety() {
        let mk = |s: u16| make_flake(s, 1, 1, 1);
        let child = |id: &str, first: u16, rhs: Option<u16>, leftmost: bool| ChildRef {
            id: id.to_string(),
            leaf: true,
            first: Some(mk(first)),
            rhs: rhs.map(mk),
            size: 1,
            bytes: None,
            leftmost,
        };

        // Windows: [.., 3], (5, 8], (8, ..) with a gap between 3 and 5.
        let children = vec![
            child("a", 1, Some(3), true),
            child("b", 5, Some(8), false),
            child("c", 8, None, false),
        ];

        // Target inside the first child.
        let got = MultiSeekCursor::floor_child(&children, &mk(2), false, cmp_spot).unwrap();
        assert_eq!(got.id, "a");

        // Target in the gap: floor would be "a" but its rhs is behind, so
        // advance to "b".
        let got = MultiSeekCursor::floor_child(&children, &mk(4), false, cmp_spot).unwrap();
        assert_eq!(got.id, "b");

        // After mode at a leaf boundary moves past the leaf whose rhs
        // equals the target.
        let got = MultiSeekCursor::floor_child(&children, &mk(8), true, cmp_spot).unwrap();
        assert_eq!(got.id, "c");

        // Unbounded rhs never advances.
        let got = MultiSeekCursor::floor_child(&children, &mk(100), false, cmp_spot).unwrap();
        assert_eq!(got.id, "c");
    }

    /// Build a two-leaf tree in memory: subjects 1..=4 in leaf-1,
    /// 5..=8 in leaf-2, one branch root.
    fn build_small_tree() -> Db<MemoryStorage, SimpleCache> {
        let storage = MemoryStorage::new();

        let left: Vec<_> = (1..=4).map(|s| make_flake(s, 1, s as i64, 1)).collect();
        let right: Vec<_> = (5..=8).map(|s| make_flake(s, 1, s as i64, 1)).collect();

        storage.insert("leaf-1", serialize_leaf_node(&left).unwrap());
        storage.insert("leaf-2", serialize_leaf_node(&right).unwrap());

        let children = vec![
            ChildRef {
                id: "leaf-1".to_string(),
                leaf: true,
                first: Some(left[0].clone()),
                rhs: Some(left[3].clone()),
                size: 4,
                bytes: None,
                leftmost: true,
            },
            ChildRef {
                id: "leaf-2".to_string(),
                leaf: true,
                first: Some(right[0].clone()),
                rhs: None,
                size: 4,
                bytes: None,
                leftmost: false,
            },
        ];
        storage.insert("branch-1", serialize_branch_node(&children).unwrap());

        let mut db = Db::genesis(storage, SimpleCache::new(64), "mydb:main");
        db.t = 1;
        let mut root = IndexNode::branch("branch-1".to_string(), IndexType::Spot);
        root.leftmost = true;
        root.t = 1;
        db.spot = root;
        db
    }

    #[tokio::test]
    async fn test_range_eq_subject() {
        let db = build_small_tree();
        let flakes = range(
            &db,
            IndexType::Spot,
            RangeTest::Eq,
            RangeMatch::subject(Sid::new(3, "s")),
            RangeOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(flakes.len(), 1);
        assert_eq!(flakes[0].s.namespace_code, 3);
    }

    #[tokio::test]
    async fn test_range_full_scan_ordered() {
        let db = build_small_tree();
        let flakes = range(
            &db,
            IndexType::Spot,
            RangeTest::Eq,
            RangeMatch::new(),
            RangeOptions::default(),
        )
        .await
        .unwrap();
        let subjects: Vec<u16> = flakes.iter().map(|f| f.s.namespace_code).collect();
        assert_eq!(subjects, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn test_range_ge_crosses_leaves() {
        let db = build_small_tree();
        let flakes = range(
            &db,
            IndexType::Spot,
            RangeTest::Ge,
            RangeMatch::subject(Sid::new(4, "s")),
            RangeOptions::default(),
        )
        .await
        .unwrap();
        let subjects: Vec<u16> = flakes.iter().map(|f| f.s.namespace_code).collect();
        assert_eq!(subjects, vec![4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn test_range_flake_limit() {
        let db = build_small_tree();
        let flakes = range(
            &db,
            IndexType::Spot,
            RangeTest::Eq,
            RangeMatch::new(),
            RangeOptions::default().with_flake_limit(3),
        )
        .await
        .unwrap();
        assert_eq!(flakes.len(), 3);
    }

    #[tokio::test]
    async fn test_range_cursor_streams_leaves() {
        let db = build_small_tree();
        let mut cursor = RangeCursor::new(
            &db,
            IndexType::Spot,
            RangeTest::Eq,
            RangeMatch::new(),
            RangeOptions::default().without_prefetch(),
        )
        .unwrap();

        let first = cursor.next_leaf(&db, &NoOverlay).await.unwrap().unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(first[0].s.namespace_code, 1);

        let second = cursor.next_leaf(&db, &NoOverlay).await.unwrap().unwrap();
        assert_eq!(second.len(), 4);
        assert_eq!(second[0].s.namespace_code, 5);

        assert!(cursor.next_leaf(&db, &NoOverlay).await.unwrap().is_none());
        assert!(cursor.is_exhausted());
    }

    #[tokio::test]
    async fn test_multi_seek_cursor_skips_between_ranges() {
        let db = build_small_tree();
        let ranges = vec![
            (
                Flake::min_for_subject(Sid::new(2, "s")),
                Flake::max_for_subject(Sid::new(2, "s")),
            ),
            (
                Flake::min_for_subject(Sid::new(6, "s")),
                Flake::max_for_subject(Sid::new(7, "s")),
            ),
        ];
        let mut cursor = MultiSeekCursor::new(
            &db,
            IndexType::Spot,
            ranges,
            RangeOptions::default(),
        )
        .unwrap();

        let first = cursor
            .next_range_flakes(&db, &NoOverlay)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cursor.last_range_index(), 0);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].s.namespace_code, 2);

        let second = cursor
            .next_range_flakes(&db, &NoOverlay)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cursor.last_range_index(), 1);
        let subjects: Vec<u16> = second.iter().map(|f| f.s.namespace_code).collect();
        assert_eq!(subjects, vec![6, 7]);

        assert!(cursor
            .next_range_flakes(&db, &NoOverlay)
            .await
            .unwrap()
            .is_none());
    }
}
