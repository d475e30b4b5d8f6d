//! FlakeValue: the polymorphic object slot of a flake.
//!
//! ## Ordering
//!
//! `FlakeValue` implements a strict total order so index comparators can
//! sort on the object position:
//!
//! 1. Values are ranked by class first: null < boolean < numeric <
//!    string < ref.
//! 2. Inside the numeric class, `Long` and `Double` compare by
//!    mathematical value ("a number is a number"); the class rank is only
//!    a tie-breaker when values are equal. `Long(3) < Double(3.5) < Long(4)`.
//! 3. NaN compares via its bit pattern so the order stays total; it lands
//!    above every finite double.
//!
//! ## Sentinels
//!
//! `FlakeValue::min()` / `FlakeValue::max()` bound wildcard ranges.

use crate::sid::Sid;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Polymorphic object value.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlakeValue {
    /// Absent value; sorts before everything.
    Null,
    /// xsd:boolean
    Boolean(bool),
    /// 64-bit signed integer
    Long(i64),
    /// 64-bit float; shares the numeric class with `Long`
    Double(f64),
    /// String value
    String(String),
    /// Reference to another subject
    Ref(Sid),
}

impl FlakeValue {
    /// Lower sentinel for range bounds.
    pub fn min() -> Self {
        FlakeValue::Null
    }

    /// Upper sentinel for range bounds: a max-sid ref sorts after any
    /// storable value.
    pub fn max() -> Self {
        FlakeValue::Ref(Sid::max())
    }

    /// Class rank used when values belong to different classes.
    ///
    /// `Long` and `Double` share the numeric class; the rank only breaks
    /// ties between mathematically equal values.
    fn class_rank(&self) -> u8 {
        match self {
            FlakeValue::Null => 0,
            FlakeValue::Boolean(_) => 1,
            FlakeValue::Long(_) => 2,
            FlakeValue::Double(_) => 3,
            FlakeValue::String(_) => 4,
            FlakeValue::Ref(_) => 5,
        }
    }

    pub fn is_ref(&self) -> bool {
        matches!(self, FlakeValue::Ref(_))
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FlakeValue::Long(_) | FlakeValue::Double(_))
    }

    /// Mathematical comparison across the numeric class.
    ///
    /// Returns `None` when either side is not numeric.
    pub fn numeric_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (FlakeValue::Long(a), FlakeValue::Long(b)) => Some(a.cmp(b)),
            (FlakeValue::Double(a), FlakeValue::Double(b)) => Some(total_f64_cmp(*a, *b)),
            (FlakeValue::Long(a), FlakeValue::Double(b)) => Some(long_vs_double(*a, *b)),
            (FlakeValue::Double(a), FlakeValue::Long(b)) => {
                Some(long_vs_double(*b, *a).reverse())
            }
            _ => None,
        }
    }

    /// Rough heap footprint, used for leaf sizing and novelty accounting.
    pub fn size_estimate_bytes(&self) -> usize {
        match self {
            FlakeValue::Null | FlakeValue::Boolean(_) => 1,
            FlakeValue::Long(_) | FlakeValue::Double(_) => 8,
            FlakeValue::String(s) => s.len(),
            FlakeValue::Ref(sid) => 2 + sid.name.len(),
        }
    }
}

/// Total order over f64: standard order for comparable values, bit order
/// for NaN so sorting never panics. NaN sorts above all finite values.
fn total_f64_cmp(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b)
        .unwrap_or_else(|| a.to_bits().cmp(&b.to_bits()))
}

fn long_vs_double(a: i64, b: f64) -> Ordering {
    if b.is_nan() {
        return Ordering::Less;
    }
    // i64 values beyond 2^53 lose precision as f64; compare through the
    // double's truncation in that band.
    (a as f64).partial_cmp(&b).unwrap_or(Ordering::Less)
}

impl PartialEq for FlakeValue {
    fn eq(&self, other: &Self) -> bool {
        if self.is_numeric() && other.is_numeric() {
            return self.numeric_cmp(other) == Some(Ordering::Equal);
        }
        match (self, other) {
            (FlakeValue::Null, FlakeValue::Null) => true,
            (FlakeValue::Boolean(a), FlakeValue::Boolean(b)) => a == b,
            (FlakeValue::String(a), FlakeValue::String(b)) => a == b,
            (FlakeValue::Ref(a), FlakeValue::Ref(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for FlakeValue {}

impl Ord for FlakeValue {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.is_numeric() && other.is_numeric() {
            if let Some(ord) = self.numeric_cmp(other) {
                // Equal values still need a deterministic order across
                // Long/Double so sorts are stable between runs.
                return ord.then_with(|| self.class_rank().cmp(&other.class_rank()));
            }
        }
        match (self, other) {
            (FlakeValue::Null, FlakeValue::Null) => Ordering::Equal,
            (FlakeValue::Boolean(a), FlakeValue::Boolean(b)) => a.cmp(b),
            (FlakeValue::String(a), FlakeValue::String(b)) => a.cmp(b),
            (FlakeValue::Ref(a), FlakeValue::Ref(b)) => a.cmp(b),
            _ => self.class_rank().cmp(&other.class_rank()),
        }
    }
}

impl PartialOrd for FlakeValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for FlakeValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // NaN and -0.0 are canonicalized so hash agrees with Eq.
        const CANONICAL_NAN_BITS: u64 = 0x7ff8_0000_0000_0000;
        match self {
            FlakeValue::Null => 0u8.hash(state),
            FlakeValue::Boolean(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            // Numeric class hashes whole doubles as longs so that
            // Long(3) and Double(3.0), which compare equal, hash alike.
            FlakeValue::Long(n) => {
                2u8.hash(state);
                n.hash(state);
            }
            FlakeValue::Double(f) => {
                if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                    2u8.hash(state);
                    (*f as i64).hash(state);
                } else {
                    3u8.hash(state);
                    let bits = if f.is_nan() {
                        CANONICAL_NAN_BITS
                    } else if *f == 0.0 {
                        0u64
                    } else {
                        f.to_bits()
                    };
                    bits.hash(state);
                }
            }
            FlakeValue::String(s) => {
                4u8.hash(state);
                s.hash(state);
            }
            FlakeValue::Ref(sid) => {
                5u8.hash(state);
                sid.hash(state);
            }
        }
    }
}

impl fmt::Display for FlakeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlakeValue::Null => write!(f, "null"),
            FlakeValue::Boolean(b) => write!(f, "{b}"),
            FlakeValue::Long(n) => write!(f, "{n}"),
            FlakeValue::Double(d) => write!(f, "{d}"),
            FlakeValue::String(s) => write!(f, "\"{s}\""),
            FlakeValue::Ref(sid) => write!(f, "{sid}"),
        }
    }
}

impl From<i64> for FlakeValue {
    fn from(v: i64) -> Self {
        FlakeValue::Long(v)
    }
}

impl From<f64> for FlakeValue {
    fn from(v: f64) -> Self {
        FlakeValue::Double(v)
    }
}

impl From<bool> for FlakeValue {
    fn from(v: bool) -> Self {
        FlakeValue::Boolean(v)
    }
}

impl From<&str> for FlakeValue {
    fn from(v: &str) -> Self {
        FlakeValue::String(v.to_string())
    }
}

impl From<String> for FlakeValue {
    fn from(v: String) -> Self {
        FlakeValue::String(v)
    }
}

impl From<Sid> for FlakeValue {
    fn from(v: Sid) -> Self {
        FlakeValue::Ref(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_ordering() {
        let vals = [
            FlakeValue::Null,
            FlakeValue::Boolean(false),
            FlakeValue::Boolean(true),
            FlakeValue::Long(-5),
            FlakeValue::Long(10),
            FlakeValue::String("a".into()),
            FlakeValue::Ref(Sid::new(1, "x")),
        ];
        for pair in vals.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_numeric_class_interleaves() {
        assert!(FlakeValue::Long(3) < FlakeValue::Double(3.5));
        assert!(FlakeValue::Double(3.5) < FlakeValue::Long(4));
        assert_eq!(FlakeValue::Long(3), FlakeValue::Double(3.0));
    }

    #[test]
    fn test_nan_sorts_totally() {
        let nan = FlakeValue::Double(f64::NAN);
        let big = FlakeValue::Double(f64::MAX);
        assert!(big < nan);
        assert_eq!(nan.cmp(&nan), Ordering::Equal);
    }

    #[test]
    fn test_min_max_sentinels() {
        let vals = [
            FlakeValue::Boolean(true),
            FlakeValue::Long(i64::MAX),
            FlakeValue::Double(f64::INFINITY),
            FlakeValue::String("zzz".into()),
            FlakeValue::Ref(Sid::new(u16::MAX - 1, "last")),
        ];
        for v in &vals {
            assert!(FlakeValue::min() < *v);
            assert!(*v < FlakeValue::max());
        }
    }

    #[test]
    fn test_equal_numbers_hash_alike() {
        use std::collections::hash_map::DefaultHasher;
        let h = |v: &FlakeValue| {
            let mut s = DefaultHasher::new();
            v.hash(&mut s);
            s.finish()
        };
        assert_eq!(h(&FlakeValue::Long(42)), h(&FlakeValue::Double(42.0)));
        assert_eq!(
            h(&FlakeValue::Double(0.0)),
            h(&FlakeValue::Double(-0.0))
        );
    }
}
