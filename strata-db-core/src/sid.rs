//! Subject identifier: a compact two-part IRI.
//!
//! A [`Sid`] pairs a `namespace_code` (u16, resolved through the root
//! record's namespace table) with the local `name` after the prefix.
//! The name is an `Arc<str>` so flakes sharing a subject clone cheaply.
//!
//! Ordering is strict and total: namespace code first, then name. Range
//! lookups rely on this for binary search over sorted flake runs.
//! `Sid::min()` / `Sid::max()` are sentinel bounds for wildcard windows;
//! `u16::MAX` sorts above every assignable namespace code.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Compact subject/predicate identifier.
///
/// Serializes as a `[namespace_code, name]` tuple in JSON.
#[derive(Clone, Debug)]
pub struct Sid {
    pub namespace_code: u16,
    pub name: Arc<str>,
}

impl Sid {
    pub fn new(namespace_code: u16, name: impl AsRef<str>) -> Self {
        Self {
            namespace_code,
            name: Arc::from(name.as_ref()),
        }
    }

    /// Build from an already-shared name without reallocating.
    pub fn with_arc(namespace_code: u16, name: Arc<str>) -> Self {
        Self {
            namespace_code,
            name,
        }
    }

    /// Lower sentinel: sorts before any valid sid.
    pub fn min() -> Self {
        Self {
            namespace_code: 0,
            name: Arc::from(""),
        }
    }

    /// Upper sentinel: `u16::MAX` namespace code sorts after any valid sid.
    pub fn max() -> Self {
        Self {
            namespace_code: u16::MAX,
            name: Arc::from(""),
        }
    }

    pub fn is_min(&self) -> bool {
        self.namespace_code == 0 && self.name.is_empty()
    }

    pub fn is_max(&self) -> bool {
        self.namespace_code == u16::MAX
    }

    pub fn name_str(&self) -> &str {
        &self.name
    }
}

impl PartialEq for Sid {
    fn eq(&self, other: &Self) -> bool {
        self.namespace_code == other.namespace_code && self.name == other.name
    }
}

impl Eq for Sid {}

impl Ord for Sid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.namespace_code
            .cmp(&other.namespace_code)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for Sid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for Sid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.namespace_code.hash(state);
        self.name.hash(state);
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.namespace_code, self.name)
    }
}

impl Serialize for Sid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeTuple;
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.namespace_code)?;
        tuple.serialize_element(self.name.as_ref())?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for Sid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let (namespace_code, name): (u16, String) = Deserialize::deserialize(deserializer)?;
        Ok(Sid {
            namespace_code,
            name: Arc::from(name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sid_ordering() {
        let a = Sid::new(1, "foo");
        let b = Sid::new(1, "bar");
        let c = Sid::new(2, "foo");

        assert!(b < a);
        assert!(a < c);
    }

    #[test]
    fn test_sid_min_max_bound_everything() {
        let min = Sid::min();
        let max = Sid::max();
        let regular = Sid::new(100, "test");

        assert!(min < regular);
        assert!(regular < max);
        assert!(min.is_min());
        assert!(max.is_max());
    }

    #[test]
    fn test_sid_serde_roundtrip() {
        let sid = Sid::new(42, "example");
        let json = serde_json::to_string(&sid).unwrap();
        assert_eq!(json, "[42,\"example\"]");

        let parsed: Sid = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, sid);
    }

    #[test]
    fn test_sid_clone_shares_name() {
        let sid = Sid::new(7, "a_reasonably_long_local_name");
        let cloned = sid.clone();
        assert!(Arc::ptr_eq(&sid.name, &cloned.name));
    }
}
