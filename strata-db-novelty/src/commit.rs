//! Commit type.
//!
//! A commit is one transaction's worth of assertions and retractions at a
//! single transaction time. History is linear: each commit's `t` is
//! strictly greater than the previous one's, and the overlay enforces
//! this on apply.

use serde::{Deserialize, Serialize};
use strata_db_core::{Flake, Sid};
use strata_db_core::FlakeValue;

/// A single transaction: flakes asserted and retracted at time `t`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Commit {
    /// Transaction time. Every flake in the commit carries this t.
    pub t: i64,
    /// Facts asserted by this transaction.
    #[serde(default)]
    pub assert: Vec<Flake>,
    /// Facts retracted by this transaction.
    #[serde(default)]
    pub retract: Vec<Flake>,
}

impl Commit {
    pub fn new(t: i64) -> Self {
        Self {
            t,
            assert: Vec::new(),
            retract: Vec::new(),
        }
    }

    /// Assert a fact at this commit's t.
    pub fn assert_fact(mut self, s: Sid, p: Sid, o: FlakeValue, dt: Sid) -> Self {
        self.assert.push(Flake::new(s, p, o, dt, self.t, true, None));
        self
    }

    /// Retract a fact at this commit's t.
    pub fn retract_fact(mut self, s: Sid, p: Sid, o: FlakeValue, dt: Sid) -> Self {
        self.retract.push(Flake::new(s, p, o, dt, self.t, false, None));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.assert.is_empty() && self.retract.is_empty()
    }

    pub fn len(&self) -> usize {
        self.assert.len() + self.retract.len()
    }

    /// All flakes in the commit, assertions then retractions, each
    /// stamped with the commit's t and the right op.
    pub fn into_flakes(self) -> Vec<Flake> {
        let t = self.t;
        let mut flakes = Vec::with_capacity(self.assert.len() + self.retract.len());
        for mut f in self.assert {
            f.t = t;
            f.op = true;
            flakes.push(f);
        }
        for mut f in self.retract {
            f.t = t;
            f.op = false;
            flakes.push(f);
        }
        flakes
    }
}
