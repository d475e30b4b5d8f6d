//! Flake: the fundamental seven-part fact tuple.
//!
//! - `s`: subject, `p`: predicate, `o`: object value, `dt`: datatype
//! - `t`: transaction time (positive, increasing; larger = later)
//! - `op`: true = assert, false = retract
//! - `m`: optional metadata (language tag, list position)
//!
//! Flakes do not implement `Ord` directly; ordering depends on the index
//! type and lives in the `comparator` module.
//!
//! Equality and hashing use the **fact identity** `(s, p, o, dt, m)` and
//! ignore `t`/`op`. Two versions of one fact at different times are equal,
//! which is what stale-version removal keys on.

use crate::sid::Sid;
use crate::value::FlakeValue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Datatype namespace code reserved for subject references.
pub const DT_REF: u16 = 1;

/// Optional flake metadata: language tag or list index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlakeMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub i: Option<i32>,
}

impl FlakeMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lang(lang: impl Into<String>) -> Self {
        Self {
            lang: Some(lang.into()),
            i: None,
        }
    }

    pub fn with_index(i: i32) -> Self {
        Self {
            lang: None,
            i: Some(i),
        }
    }

    pub fn min() -> Self {
        Self {
            lang: None,
            i: Some(i32::MIN),
        }
    }

    pub fn max() -> Self {
        Self {
            lang: None,
            i: Some(i32::MAX),
        }
    }

    /// Order by list index first, then by language tag; absent fields
    /// sort before present ones.
    pub fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (&self.i, &other.i) {
            (Some(a), Some(b)) => a.cmp(b),
            (Some(_), None) => std::cmp::Ordering::Greater,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (None, None) => match (&self.lang, &other.lang) {
                (Some(a), Some(b)) => a.cmp(b),
                (Some(_), None) => std::cmp::Ordering::Greater,
                (None, Some(_)) => std::cmp::Ordering::Less,
                (None, None) => std::cmp::Ordering::Equal,
            },
        }
    }
}

impl PartialOrd for FlakeMeta {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FlakeMeta {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        FlakeMeta::cmp(self, other)
    }
}

/// A single fact: assertion or retraction of (s, p, o, dt) at time t.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Flake {
    pub s: Sid,
    pub p: Sid,
    pub o: FlakeValue,
    pub dt: Sid,
    pub t: i64,
    pub op: bool,
    pub m: Option<FlakeMeta>,
}

impl Flake {
    pub fn new(
        s: Sid,
        p: Sid,
        o: FlakeValue,
        dt: Sid,
        t: i64,
        op: bool,
        m: Option<FlakeMeta>,
    ) -> Self {
        Self {
            s,
            p,
            o,
            dt,
            t,
            op,
            m,
        }
    }

    /// Minimum flake under every comparator: all components at their
    /// lower sentinel.
    pub fn min_sentinel() -> Self {
        Self {
            s: Sid::min(),
            p: Sid::min(),
            o: FlakeValue::min(),
            dt: Sid::min(),
            t: i64::MIN,
            op: false,
            m: Some(FlakeMeta::min()),
        }
    }

    /// Maximum flake under every comparator.
    pub fn max_sentinel() -> Self {
        Self {
            s: Sid::max(),
            p: Sid::max(),
            o: FlakeValue::max(),
            dt: Sid::max(),
            t: i64::MAX,
            op: true,
            m: Some(FlakeMeta::max()),
        }
    }

    /// Lower bound for "all flakes of subject s" in a subject-first order.
    pub fn min_for_subject(s: Sid) -> Self {
        Self {
            s,
            ..Self::min_sentinel()
        }
    }

    pub fn max_for_subject(s: Sid) -> Self {
        Self {
            s,
            ..Self::max_sentinel()
        }
    }

    pub fn min_for_subject_predicate(s: Sid, p: Sid) -> Self {
        Self {
            s,
            p,
            ..Self::min_sentinel()
        }
    }

    pub fn max_for_subject_predicate(s: Sid, p: Sid) -> Self {
        Self {
            s,
            p,
            ..Self::max_sentinel()
        }
    }

    /// Bounds for "all flakes of predicate p" in a predicate-first order.
    pub fn min_for_predicate(p: Sid) -> Self {
        Self {
            p,
            ..Self::min_sentinel()
        }
    }

    pub fn max_for_predicate(p: Sid) -> Self {
        Self {
            p,
            ..Self::max_sentinel()
        }
    }

    pub fn min_for_predicate_object(p: Sid, o: FlakeValue, dt: Sid) -> Self {
        Self {
            p,
            o,
            dt,
            ..Self::min_sentinel()
        }
    }

    pub fn max_for_predicate_object(p: Sid, o: FlakeValue, dt: Sid) -> Self {
        Self {
            p,
            o,
            dt,
            ..Self::max_sentinel()
        }
    }

    pub fn min_for_object(o: FlakeValue, dt: Sid) -> Self {
        Self {
            o,
            dt,
            ..Self::min_sentinel()
        }
    }

    pub fn max_for_object(o: FlakeValue, dt: Sid) -> Self {
        Self {
            o,
            dt,
            ..Self::max_sentinel()
        }
    }

    /// Bounds for "all flakes at transaction t" in the t-first order.
    pub fn min_for_t(t: i64) -> Self {
        Self {
            t,
            ..Self::min_sentinel()
        }
    }

    pub fn max_for_t(t: i64) -> Self {
        Self {
            t,
            ..Self::max_sentinel()
        }
    }

    /// A reference flake points at another subject via the reserved
    /// ref datatype namespace.
    pub fn is_ref(&self) -> bool {
        self.dt.namespace_code == DT_REF && self.dt.name.as_ref() == "id"
    }

    pub fn is_assert(&self) -> bool {
        self.op
    }

    pub fn is_retract(&self) -> bool {
        !self.op
    }

    /// Retraction of this fact at the same t.
    pub fn retract(&self) -> Self {
        Self {
            op: false,
            ..self.clone()
        }
    }

    /// Retraction of this fact at a later t.
    pub fn retract_at(&self, t: i64) -> Self {
        Self {
            t,
            op: false,
            ..self.clone()
        }
    }

    /// Fast deterministic size estimate, used for leaf sizing and novelty
    /// accounting. Speed over accuracy: fixed base plus object and meta
    /// additions, allocation-free and platform-stable.
    pub fn size_estimate_bytes(&self) -> u64 {
        const BASE: u64 = 38;

        let o_size = self.o.size_estimate_bytes() as u64;

        let m_size: u64 = match &self.m {
            None => 0,
            Some(m) => {
                let lang = m.lang.as_ref().map(|l| l.len() as u64).unwrap_or(0);
                let idx = m.i.map(|_| 4u64).unwrap_or(0);
                4 + lang + idx
            }
        };

        BASE + o_size + m_size
    }
}

/// Size estimate for a run of flakes.
pub fn size_flakes_estimate(flakes: &[Flake]) -> u64 {
    flakes.iter().map(|f| f.size_estimate_bytes()).sum()
}

// Equality is fact identity: t and op excluded.

impl PartialEq for Flake {
    fn eq(&self, other: &Self) -> bool {
        self.s == other.s
            && self.p == other.p
            && self.o == other.o
            && self.dt == other.dt
            && self.m == other.m
    }
}

impl Eq for Flake {}

impl Hash for Flake {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.s.hash(state);
        self.p.hash(state);
        self.o.hash(state);
        self.dt.hash(state);
        self.m.hash(state);
    }
}

impl fmt::Display for Flake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op_str = if self.op { "+" } else { "-" };
        write!(
            f,
            "[{} {} {} {} t:{} {}]",
            self.s, self.p, self.o, self.dt, self.t, op_str
        )
    }
}
