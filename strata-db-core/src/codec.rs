//! JSON wire format for persisted index data.
//!
//! Three blob shapes exist: leaf nodes (`{"v":1,"flakes":[..]}`), branch
//! nodes (`{"v":1,"children":[..]}`), and root records. Every blob carries
//! a `v` field; readers reject versions they do not understand rather than
//! guessing. Blobs are content-addressed, so serialization must be
//! deterministic: callers sort flakes with the index comparator before
//! writing a leaf.

use crate::error::{Error, Result};
use crate::flake::Flake;
use crate::index::ChildRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current wire format version for all blob shapes.
pub const WIRE_VERSION: i32 = 1;

fn check_version(v: i32, what: &str) -> Result<()> {
    if v != WIRE_VERSION {
        return Err(Error::invalid_index(format!(
            "unsupported {} version: {} (expected {})",
            what, v, WIRE_VERSION
        )));
    }
    Ok(())
}

// === Leaf nodes ===

#[derive(Debug, Serialize, Deserialize)]
struct WireLeaf {
    v: i32,
    flakes: Vec<Flake>,
}

/// Parse a leaf node blob into its flakes.
pub fn parse_leaf_node(bytes: &[u8]) -> Result<Vec<Flake>> {
    let leaf: WireLeaf = serde_json::from_slice(bytes)?;
    check_version(leaf.v, "leaf")?;
    Ok(leaf.flakes)
}

/// Serialize a leaf node.
///
/// Flakes are written in the order given; pre-sort with the index
/// comparator so identical leaves produce identical bytes.
pub fn serialize_leaf_node(flakes: &[Flake]) -> Result<Vec<u8>> {
    let leaf = WireLeaf {
        v: WIRE_VERSION,
        flakes: flakes.to_vec(),
    };
    Ok(serde_json::to_vec(&leaf)?)
}

// === Branch nodes ===

/// Child pointer as stored inside a branch blob.
#[derive(Debug, Serialize, Deserialize)]
pub struct WireChildRef {
    pub id: String,
    #[serde(default)]
    pub leaf: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<Flake>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rhs: Option<Flake>,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default)]
    pub leftmost: bool,
}

impl WireChildRef {
    pub fn from_child_ref(child: &ChildRef) -> Self {
        Self {
            id: child.id.clone(),
            leaf: child.leaf,
            first: child.first.clone(),
            rhs: child.rhs.clone(),
            size: child.size,
            bytes: child.bytes,
            leftmost: child.leftmost,
        }
    }

    pub fn into_child_ref(self) -> ChildRef {
        ChildRef {
            id: self.id,
            leaf: self.leaf,
            first: self.first,
            rhs: self.rhs,
            size: self.size,
            bytes: self.bytes,
            leftmost: self.leftmost,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireBranch {
    v: i32,
    children: Vec<WireChildRef>,
}

/// Parse a branch node blob into its child references.
pub fn parse_branch_node(bytes: &[u8]) -> Result<Vec<ChildRef>> {
    let branch: WireBranch = serde_json::from_slice(bytes)?;
    check_version(branch.v, "branch")?;
    Ok(branch
        .children
        .into_iter()
        .map(WireChildRef::into_child_ref)
        .collect())
}

/// Serialize a branch node from its child references.
pub fn serialize_branch_node(children: &[ChildRef]) -> Result<Vec<u8>> {
    let branch = WireBranch {
        v: WIRE_VERSION,
        children: children.iter().map(WireChildRef::from_child_ref).collect(),
    };
    Ok(serde_json::to_vec(&branch)?)
}

// === Root records ===

/// Pointer from a root record to the root it superseded, kept so garbage
/// collection can walk the chain backwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrevIndexRef {
    pub t: i64,
    pub address: String,
}

/// Pointer to the garbage record written alongside a reindex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GarbageRef {
    pub address: String,
}

/// Whole-index statistics carried on the root record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootStats {
    /// Facts per ordering (each ordering holds the same set).
    pub flakes: u64,
    /// Serialized bytes of one ordering's tree.
    pub size: u64,
}

/// Parsed root record: one entry point per ordering, plus provenance.
#[derive(Debug, Clone)]
pub struct RootRecord {
    pub alias: String,
    /// Transaction time the index covers.
    pub t: i64,
    pub spot: Option<ChildRef>,
    pub psot: Option<ChildRef>,
    pub post: Option<ChildRef>,
    pub opst: Option<ChildRef>,
    pub tspo: Option<ChildRef>,
    pub stats: Option<RootStats>,
    /// Namespace code table: code to namespace prefix, used to decode
    /// `Sid`s back to full identifiers.
    pub namespaces: BTreeMap<u16, String>,
    /// Wall-clock millis when the root was written. Informational only.
    pub timestamp: Option<i64>,
    pub prev_index: Option<PrevIndexRef>,
    pub garbage: Option<GarbageRef>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireRootRecord {
    v: i32,
    alias: String,
    t: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    spot: Option<WireChildRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    psot: Option<WireChildRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    post: Option<WireChildRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    opst: Option<WireChildRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tspo: Option<WireChildRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stats: Option<RootStats>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    namespaces: BTreeMap<u16, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prev_index: Option<PrevIndexRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    garbage: Option<GarbageRef>,
}

/// Parse a root record blob.
pub fn parse_root_record(bytes: &[u8]) -> Result<RootRecord> {
    let raw: WireRootRecord = serde_json::from_slice(bytes)?;
    check_version(raw.v, "root record")?;
    Ok(RootRecord {
        alias: raw.alias,
        t: raw.t,
        spot: raw.spot.map(WireChildRef::into_child_ref),
        psot: raw.psot.map(WireChildRef::into_child_ref),
        post: raw.post.map(WireChildRef::into_child_ref),
        opst: raw.opst.map(WireChildRef::into_child_ref),
        tspo: raw.tspo.map(WireChildRef::into_child_ref),
        stats: raw.stats,
        namespaces: raw.namespaces,
        timestamp: raw.timestamp,
        prev_index: raw.prev_index,
        garbage: raw.garbage,
    })
}

/// Serialize a root record.
pub fn serialize_root_record(root: &RootRecord) -> Result<Vec<u8>> {
    let wire = WireRootRecord {
        v: WIRE_VERSION,
        alias: root.alias.clone(),
        t: root.t,
        spot: root.spot.as_ref().map(WireChildRef::from_child_ref),
        psot: root.psot.as_ref().map(WireChildRef::from_child_ref),
        post: root.post.as_ref().map(WireChildRef::from_child_ref),
        opst: root.opst.as_ref().map(WireChildRef::from_child_ref),
        tspo: root.tspo.as_ref().map(WireChildRef::from_child_ref),
        stats: root.stats,
        namespaces: root.namespaces.clone(),
        timestamp: root.timestamp,
        prev_index: root.prev_index.clone(),
        garbage: root.garbage.clone(),
    };
    Ok(serde_json::to_vec(&wire)?)
}

/// Garbage record: node addresses freed by a reindex, persisted so a later
/// collection pass can delete them once the old root falls out of retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GarbageRecord {
    pub v: i32,
    pub alias: String,
    /// Transaction time of the reindex that orphaned these nodes.
    pub t: i64,
    pub nodes: Vec<String>,
}

impl GarbageRecord {
    pub fn new(alias: impl Into<String>, t: i64, nodes: Vec<String>) -> Self {
        Self {
            v: WIRE_VERSION,
            alias: alias.into(),
            t,
            nodes,
        }
    }
}

/// Parse a garbage record blob.
pub fn parse_garbage_record(bytes: &[u8]) -> Result<GarbageRecord> {
    let record: GarbageRecord = serde_json::from_slice(bytes)?;
    check_version(record.v, "garbage record")?;
    Ok(record)
}

/// Serialize a garbage record.
pub fn serialize_garbage_record(record: &GarbageRecord) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(record)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sid::Sid;
    use crate::value::FlakeValue;

    fn make_flake(s: &str, t: i64) -> Flake {
        Flake::new(
            Sid::new(1, s),
            Sid::new(2, "name"),
            FlakeValue::String(format!("value-{}", s)),
            Sid::new(3, "string"),
            t,
            true,
            None,
        )
    }

    #[test]
    fn test_leaf_round_trip() {
        let flakes = vec![make_flake("a", 1), make_flake("b", 2)];
        let bytes = serialize_leaf_node(&flakes).unwrap();
        let parsed = parse_leaf_node(&bytes).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], flakes[0]);
        assert_eq!(parsed[0].t, 1);
        assert_eq!(parsed[1].s.name.as_ref(), "b");
    }

    #[test]
    fn test_leaf_ref_object_survives() {
        let mut f = make_flake("a", 5);
        f.o = FlakeValue::Ref(Sid::new(1, "b"));
        f.dt = Sid::new(1, "id");
        let bytes = serialize_leaf_node(std::slice::from_ref(&f)).unwrap();
        let parsed = parse_leaf_node(&bytes).unwrap();
        assert!(parsed[0].is_ref());
        match &parsed[0].o {
            FlakeValue::Ref(sid) => assert_eq!(sid.name.as_ref(), "b"),
            other => panic!("expected ref, got {:?}", other),
        }
    }

    #[test]
    fn test_leaf_double_object_survives() {
        let mut f = make_flake("a", 5);
        f.o = FlakeValue::Double(3.5);
        let bytes = serialize_leaf_node(std::slice::from_ref(&f)).unwrap();
        let parsed = parse_leaf_node(&bytes).unwrap();
        assert!(matches!(parsed[0].o, FlakeValue::Double(d) if d == 3.5));
    }

    #[test]
    fn test_branch_round_trip() {
        let children = vec![
            ChildRef {
                id: "leaf-1".to_string(),
                leaf: true,
                first: Some(make_flake("a", 1)),
                rhs: Some(make_flake("m", 1)),
                size: 10,
                bytes: Some(500),
                leftmost: true,
            },
            ChildRef {
                id: "leaf-2".to_string(),
                leaf: true,
                first: Some(make_flake("m", 1)),
                rhs: None,
                size: 7,
                bytes: Some(300),
                leftmost: false,
            },
        ];
        let bytes = serialize_branch_node(&children).unwrap();
        let parsed = parse_branch_node(&bytes).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].id, "leaf-1");
        assert!(parsed[0].leftmost);
        assert_eq!(parsed[1].rhs, None);
        assert_eq!(parsed[0].bytes, Some(500));
    }

    #[test]
    fn test_root_record_round_trip() {
        let root = RootRecord {
            alias: "mydb:main".to_string(),
            t: 42,
            spot: Some(ChildRef {
                id: "root-spot".to_string(),
                leaf: false,
                first: None,
                rhs: None,
                size: 100,
                bytes: Some(2000),
                leftmost: true,
            }),
            psot: None,
            post: None,
            opst: None,
            tspo: None,
            stats: Some(RootStats {
                flakes: 100,
                size: 12_345,
            }),
            namespaces: BTreeMap::from([(1, "http://example.org/".to_string())]),
            timestamp: Some(1_700_000_000_000),
            prev_index: Some(PrevIndexRef {
                t: 20,
                address: "strata:memory://mydb/main/index/roots/old.json".to_string(),
            }),
            garbage: None,
        };
        let bytes = serialize_root_record(&root).unwrap();
        let parsed = parse_root_record(&bytes).unwrap();
        assert_eq!(parsed.alias, "mydb:main");
        assert_eq!(parsed.t, 42);
        assert_eq!(parsed.spot.as_ref().map(|c| c.id.as_str()), Some("root-spot"));
        assert!(parsed.psot.is_none());
        assert_eq!(parsed.prev_index.as_ref().map(|p| p.t), Some(20));
        assert_eq!(parsed.stats.map(|s| s.flakes), Some(100));
        assert_eq!(
            parsed.namespaces.get(&1).map(String::as_str),
            Some("http://example.org/")
        );
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let json = br#"{"v":9,"flakes":[]}"#;
        let err = parse_leaf_node(json).unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }

    #[test]
    fn test_garbage_record_round_trip() {
        let record = GarbageRecord::new(
            "mydb:main",
            42,
            vec!["a.json".to_string(), "b.json".to_string()],
        );
        let bytes = serialize_garbage_record(&record).unwrap();
        let parsed = parse_garbage_record(&bytes).unwrap();
        assert_eq!(parsed.t, 42);
        assert_eq!(parsed.nodes.len(), 2);
    }
}
