//! Index tree nodes.
//!
//! Each ordering persists as a tree of immutable, copy-on-write nodes:
//! branches hold child references, leaves hold sorted flakes. Nodes are
//! never mutated after creation; a rebuild writes fresh nodes with fresh
//! ids.
//!
//! Every node carries boundary metadata (`first`, `rhs`, `leftmost`)
//! under its index's comparator. A node covers the window `(first, rhs]`,
//! except the leftmost node at each level which also covers everything
//! below `first`. Traversal prunes on these boundaries without touching
//! node content.

use crate::comparator::IndexType;
use crate::flake::Flake;
use std::sync::Arc;

/// Content-addressed node identifier.
pub type NodeId = String;

/// Id of the genesis root before anything is indexed. Resolution
/// synthesizes it from the overlay alone, with no storage read.
pub const EMPTY_NODE_ID: &str = "empty";

/// Pointer to a child node held inside a branch.
#[derive(Clone, Debug)]
pub struct ChildRef {
    pub id: NodeId,
    pub leaf: bool,
    /// First (minimum) flake covered; `None` only on unbounded edges.
    pub first: Option<Flake>,
    /// Right-hand (maximum, inclusive) boundary; `None` for the rightmost.
    pub rhs: Option<Flake>,
    /// Subtree flake count. A count, not bytes; byte sizes live in
    /// `bytes`.
    pub size: u64,
    /// Serialized byte size of the child node, recorded at build time for
    /// cache accounting.
    pub bytes: Option<u64>,
    pub leftmost: bool,
}

impl ChildRef {
    pub fn new(id: NodeId, leaf: bool) -> Self {
        Self {
            id,
            leaf,
            first: None,
            rhs: None,
            size: 0,
            bytes: None,
            leftmost: false,
        }
    }

    /// Could this child's window intersect `[start, end]`?
    pub fn intersects_range(
        &self,
        start: &Flake,
        end: &Flake,
        cmp: fn(&Flake, &Flake) -> std::cmp::Ordering,
    ) -> bool {
        if let Some(ref first) = self.first {
            if !self.leftmost && cmp(first, end) == std::cmp::Ordering::Greater {
                return false;
            }
        }
        if let Some(ref rhs) = self.rhs {
            if cmp(rhs, start) == std::cmp::Ordering::Less {
                return false;
            }
        }
        true
    }
}

/// Unresolved node: boundary metadata without content.
#[derive(Clone, Debug)]
pub struct IndexNode {
    pub id: NodeId,
    pub leaf: bool,
    pub index_type: IndexType,
    pub first: Option<Flake>,
    pub rhs: Option<Flake>,
    pub leftmost: bool,
    /// Transaction time of the index build that wrote this node.
    pub t: i64,
    pub size: u64,
    pub bytes: Option<u64>,
}

impl IndexNode {
    pub fn branch(id: NodeId, index_type: IndexType) -> Self {
        Self {
            id,
            leaf: false,
            index_type,
            first: None,
            rhs: None,
            leftmost: false,
            t: 0,
            size: 0,
            bytes: None,
        }
    }

    pub fn leaf(id: NodeId, index_type: IndexType) -> Self {
        Self {
            id,
            leaf: true,
            index_type,
            first: None,
            rhs: None,
            leftmost: false,
            t: 0,
            size: 0,
            bytes: None,
        }
    }

    /// Descend: turn a branch's child pointer into an unresolved node.
    pub fn from_child_ref(child: &ChildRef, index_type: IndexType, t: i64) -> Self {
        Self {
            id: child.id.clone(),
            leaf: child.leaf,
            index_type,
            first: child.first.clone(),
            rhs: child.rhs.clone(),
            leftmost: child.leftmost,
            t,
            size: child.size,
            bytes: child.bytes,
        }
    }

    pub fn is_empty_root(&self) -> bool {
        self.id == EMPTY_NODE_ID
    }

    /// Could this node's window intersect `[start, end]`?
    pub fn intersects_range(&self, start: &Flake, end: &Flake) -> bool {
        let cmp = self.index_type.comparator();
        if let Some(ref first) = self.first {
            if !self.leftmost && cmp(first, end) == std::cmp::Ordering::Greater {
                return false;
            }
        }
        if let Some(ref rhs) = self.rhs {
            if cmp(rhs, start) == std::cmp::Ordering::Less {
                return false;
            }
        }
        true
    }
}

/// Node with content loaded.
#[derive(Clone, Debug)]
pub enum ResolvedNode {
    Branch {
        node: IndexNode,
        children: Arc<[ChildRef]>,
    },
    Leaf {
        node: IndexNode,
        flakes: Arc<[Flake]>,
    },
}

impl ResolvedNode {
    pub fn branch(node: IndexNode, children: Arc<[ChildRef]>) -> Self {
        ResolvedNode::Branch { node, children }
    }

    pub fn leaf(node: IndexNode, flakes: Arc<[Flake]>) -> Self {
        ResolvedNode::Leaf { node, flakes }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, ResolvedNode::Leaf { .. })
    }

    pub fn is_branch(&self) -> bool {
        matches!(self, ResolvedNode::Branch { .. })
    }

    pub fn node(&self) -> &IndexNode {
        match self {
            ResolvedNode::Branch { node, .. } => node,
            ResolvedNode::Leaf { node, .. } => node,
        }
    }

    pub fn children(&self) -> Option<&[ChildRef]> {
        match self {
            ResolvedNode::Branch { children, .. } => Some(children),
            ResolvedNode::Leaf { .. } => None,
        }
    }

    pub fn flakes(&self) -> Option<&[Flake]> {
        match self {
            ResolvedNode::Leaf { flakes, .. } => Some(flakes),
            ResolvedNode::Branch { .. } => None,
        }
    }

    /// Drop back to metadata only. `unresolve(resolve(n))` preserves every
    /// metadata field.
    pub fn unresolve(&self) -> IndexNode {
        self.node().clone()
    }

    /// Byte size for cache accounting: persisted `bytes` when present,
    /// estimated otherwise.
    pub fn size_bytes(&self) -> usize {
        match self {
            ResolvedNode::Branch { node, children } => node
                .bytes
                .map(|b| b as usize)
                .unwrap_or_else(|| children.len() * 200),
            ResolvedNode::Leaf { node, flakes } => node.bytes.map(|b| b as usize).unwrap_or_else(
                || {
                    flakes
                        .iter()
                        .map(|f| f.size_estimate_bytes() as usize)
                        .sum::<usize>()
                },
            ),
        }
    }
}

/// Root of a brand-new index: an empty leftmost leaf.
pub fn empty_root(index_type: IndexType) -> IndexNode {
    IndexNode {
        id: EMPTY_NODE_ID.to_string(),
        leaf: true,
        index_type,
        first: Some(Flake::max_sentinel()),
        rhs: None,
        leftmost: true,
        t: 0,
        size: 0,
        bytes: Some(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sid::Sid;
    use crate::value::FlakeValue;

    fn make_flake(s: u16, t: i64) -> Flake {
        Flake::new(
            Sid::new(s, "test"),
            Sid::new(1, "p"),
            FlakeValue::Long(1),
            Sid::new(2, "long"),
            t,
            true,
            None,
        )
    }

    #[test]
    fn test_child_ref_intersects() {
        let child = ChildRef {
            id: "test".to_string(),
            leaf: true,
            first: Some(make_flake(10, 1)),
            rhs: Some(make_flake(20, 1)),
            size: 100,
            bytes: None,
            leftmost: false,
        };

        let cmp = IndexType::Spot.comparator();

        assert!(child.intersects_range(&make_flake(12, 1), &make_flake(18, 1), cmp));
        assert!(child.intersects_range(&make_flake(5, 1), &make_flake(15, 1), cmp));
        assert!(child.intersects_range(&make_flake(15, 1), &make_flake(25, 1), cmp));
        assert!(!child.intersects_range(&make_flake(1, 1), &make_flake(5, 1), cmp));
        assert!(!child.intersects_range(&make_flake(25, 1), &make_flake(30, 1), cmp));
    }

    #[test]
    fn test_leftmost_child_covers_below_first() {
        let child = ChildRef {
            id: "left".to_string(),
            leaf: true,
            first: Some(make_flake(10, 1)),
            rhs: Some(make_flake(20, 1)),
            size: 10,
            bytes: None,
            leftmost: true,
        };
        let cmp = IndexType::Spot.comparator();
        // a leftmost node still owns keys below its first boundary
        assert!(child.intersects_range(&make_flake(1, 1), &make_flake(5, 1), cmp));
    }

    #[test]
    fn test_from_child_ref_copies_boundaries() {
        let child = ChildRef {
            id: "abc123".to_string(),
            leaf: true,
            first: Some(make_flake(1, 1)),
            rhs: Some(make_flake(10, 1)),
            size: 1000,
            bytes: Some(5000),
            leftmost: true,
        };

        let node = IndexNode::from_child_ref(&child, IndexType::Spot, 7);

        assert_eq!(node.id, "abc123");
        assert!(node.leaf);
        assert!(node.leftmost);
        assert_eq!(node.size, 1000);
        assert_eq!(node.t, 7);
    }

    #[test]
    fn test_unresolve_roundtrips_metadata() {
        let node = IndexNode {
            id: "leaf-1".to_string(),
            leaf: true,
            index_type: IndexType::Post,
            first: Some(make_flake(1, 1)),
            rhs: Some(make_flake(9, 1)),
            leftmost: false,
            t: 3,
            size: 42,
            bytes: Some(999),
        };
        let resolved = ResolvedNode::leaf(node.clone(), Arc::from(vec![]));
        let back = resolved.unresolve();

        assert_eq!(back.id, node.id);
        assert_eq!(back.leaf, node.leaf);
        assert_eq!(back.index_type, node.index_type);
        assert_eq!(back.leftmost, node.leftmost);
        assert_eq!(back.t, node.t);
        assert_eq!(back.size, node.size);
        assert_eq!(back.bytes, node.bytes);
        assert_eq!(back.first.as_ref().map(|f| f.t), node.first.as_ref().map(|f| f.t));
    }

    #[test]
    fn test_empty_root_shape() {
        let root = empty_root(IndexType::Spot);
        assert!(root.leaf);
        assert!(root.leftmost);
        assert!(root.is_empty_root());
        assert_eq!(root.size, 0);
        assert_eq!(root.bytes, Some(0));
    }
}
