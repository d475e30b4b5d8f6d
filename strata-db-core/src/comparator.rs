//! Index comparators.
//!
//! Five sort orders, one per persisted index, each a strict total order:
//!
//! | Index | Order          | Use case                         |
//! |-------|----------------|----------------------------------|
//! | SPOT  | s, p, o, t     | subject lookups                  |
//! | PSOT  | p, s, o, t     | predicate-subject lookups        |
//! | POST  | p, o, s, t     | value lookups                    |
//! | OPST  | o, p, s, t     | reverse reference traversal      |
//! | TSPO  | t, s, p, o     | transaction-first audit scans    |
//!
//! No nil-as-wildcard anywhere: wildcard windows use explicit min/max
//! sentinel flakes. Every comparator ends with (t asc, op, m) so multiple
//! versions of one fact sit adjacent, oldest first.

use crate::flake::Flake;
use std::cmp::Ordering;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexType {
    Spot,
    Psot,
    Post,
    Opst,
    Tspo,
}

impl IndexType {
    pub fn all() -> &'static [IndexType] {
        &[
            IndexType::Spot,
            IndexType::Psot,
            IndexType::Post,
            IndexType::Opst,
            IndexType::Tspo,
        ]
    }

    pub fn comparator(&self) -> fn(&Flake, &Flake) -> Ordering {
        match self {
            IndexType::Spot => cmp_spot,
            IndexType::Psot => cmp_psot,
            IndexType::Post => cmp_post,
            IndexType::Opst => cmp_opst,
            IndexType::Tspo => cmp_tspo,
        }
    }

    pub fn compare(&self, a: &Flake, b: &Flake) -> Ordering {
        self.comparator()(a, b)
    }

    /// Pick the index for a lookup given which components are bound.
    ///
    /// SPOT when the subject is known, PSOT for predicate scans, POST for
    /// predicate-value lookups, OPST for reverse ref traversal, SPOT as
    /// the fallback full scan.
    pub fn for_query(s_bound: bool, p_bound: bool, o_bound: bool, o_is_ref: bool) -> IndexType {
        if s_bound {
            IndexType::Spot
        } else if p_bound && !o_bound {
            IndexType::Psot
        } else if p_bound && o_bound {
            IndexType::Post
        } else if o_bound && o_is_ref {
            IndexType::Opst
        } else {
            IndexType::Spot
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            IndexType::Spot => "spot",
            IndexType::Psot => "psot",
            IndexType::Post => "post",
            IndexType::Opst => "opst",
            IndexType::Tspo => "tspo",
        }
    }
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for IndexType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "spot" => Ok(IndexType::Spot),
            "psot" => Ok(IndexType::Psot),
            "post" => Ok(IndexType::Post),
            "opst" => Ok(IndexType::Opst),
            "tspo" => Ok(IndexType::Tspo),
            _ => Err(format!("unknown index type: {}", s)),
        }
    }
}

/// Object comparison: value first, datatype as tie-breaker.
fn cmp_object(f1: &Flake, f2: &Flake) -> Ordering {
    f1.o.cmp(&f2.o).then_with(|| f1.dt.cmp(&f2.dt))
}

fn cmp_meta(f1: &Flake, f2: &Flake) -> Ordering {
    match (&f1.m, &f2.m) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(m1), Some(m2)) => m1.cmp(m2),
    }
}

pub fn cmp_spot(f1: &Flake, f2: &Flake) -> Ordering {
    f1.s.cmp(&f2.s)
        .then_with(|| f1.p.cmp(&f2.p))
        .then_with(|| cmp_object(f1, f2))
        .then_with(|| f1.t.cmp(&f2.t))
        .then_with(|| f1.op.cmp(&f2.op))
        .then_with(|| cmp_meta(f1, f2))
}

pub fn cmp_psot(f1: &Flake, f2: &Flake) -> Ordering {
    f1.p.cmp(&f2.p)
        .then_with(|| f1.s.cmp(&f2.s))
        .then_with(|| cmp_object(f1, f2))
        .then_with(|| f1.t.cmp(&f2.t))
        .then_with(|| f1.op.cmp(&f2.op))
        .then_with(|| cmp_meta(f1, f2))
}

pub fn cmp_post(f1: &Flake, f2: &Flake) -> Ordering {
    f1.p.cmp(&f2.p)
        .then_with(|| cmp_object(f1, f2))
        .then_with(|| f1.s.cmp(&f2.s))
        .then_with(|| f1.t.cmp(&f2.t))
        .then_with(|| f1.op.cmp(&f2.op))
        .then_with(|| cmp_meta(f1, f2))
}

pub fn cmp_opst(f1: &Flake, f2: &Flake) -> Ordering {
    cmp_object(f1, f2)
        .then_with(|| f1.p.cmp(&f2.p))
        .then_with(|| f1.s.cmp(&f2.s))
        .then_with(|| f1.t.cmp(&f2.t))
        .then_with(|| f1.op.cmp(&f2.op))
        .then_with(|| cmp_meta(f1, f2))
}

/// Transaction-first: groups all flakes of one commit together.
pub fn cmp_tspo(f1: &Flake, f2: &Flake) -> Ordering {
    f1.t.cmp(&f2.t)
        .then_with(|| f1.s.cmp(&f2.s))
        .then_with(|| f1.p.cmp(&f2.p))
        .then_with(|| cmp_object(f1, f2))
        .then_with(|| f1.op.cmp(&f2.op))
        .then_with(|| cmp_meta(f1, f2))
}

/// Adapter giving a flake `Ord` under one index so std sorting and
/// binary search apply.
pub struct FlakeOrd<'a> {
    pub flake: &'a Flake,
    pub index_type: IndexType,
}

impl<'a> FlakeOrd<'a> {
    pub fn new(flake: &'a Flake, index_type: IndexType) -> Self {
        Self { flake, index_type }
    }
}

impl PartialEq for FlakeOrd<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.index_type.compare(self.flake, other.flake) == Ordering::Equal
    }
}

impl Eq for FlakeOrd<'_> {}

impl PartialOrd for FlakeOrd<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FlakeOrd<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index_type.compare(self.flake, other.flake)
    }
}
