use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Lattice, Widen};

const NEG_INF: i64 = i64::MIN;
const POS_INF: i64 = i64::MAX;

/// Integer intervals with infinite bounds, used for buffer occupancy
/// and wait-group counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    Bot,
    Range { lo: i64, hi: i64 },
}

impl Interval {
    pub fn constant(n: i64) -> Self {
        Interval::Range { lo: n, hi: n }
    }

    pub fn range(lo: i64, hi: i64) -> Self {
        if lo > hi {
            Interval::Bot
        } else {
            Interval::Range { lo, hi }
        }
    }

    /// `[n, +∞)`
    pub fn at_least(n: i64) -> Self {
        Interval::Range { lo: n, hi: POS_INF }
    }

    pub fn bounds(&self) -> Option<(i64, i64)> {
        match *self {
            Interval::Bot => None,
            Interval::Range { lo, hi } => Some((lo, hi)),
        }
    }

    pub fn as_constant(&self) -> Option<i64> {
        match *self {
            Interval::Range { lo, hi } if lo == hi && lo != NEG_INF && hi != POS_INF => Some(lo),
            _ => None,
        }
    }

    pub fn contains(&self, n: i64) -> bool {
        matches!(*self, Interval::Range { lo, hi } if lo <= n && n <= hi)
    }

    /// Some concrete value is strictly below `n`.
    pub fn may_be_below(&self, n: i64) -> bool {
        matches!(*self, Interval::Range { lo, .. } if lo < n)
    }

    /// Some concrete value is strictly above `n`.
    pub fn may_be_above(&self, n: i64) -> bool {
        matches!(*self, Interval::Range { hi, .. } if hi > n)
    }

    /// Every concrete value is strictly below `n`.
    pub fn all_below(&self, n: i64) -> bool {
        matches!(*self, Interval::Range { hi, .. } if hi < n)
    }

    pub fn add(&self, other: &Interval) -> Interval {
        match (*self, *other) {
            (Interval::Range { lo: a, hi: b }, Interval::Range { lo: c, hi: d }) => {
                Interval::Range {
                    lo: add_bound(a, c),
                    hi: add_bound(b, d),
                }
            }
            _ => Interval::Bot,
        }
    }

    pub fn add_constant(&self, n: i64) -> Interval {
        self.add(&Interval::constant(n))
    }

    /// Restrict to `[lo, hi]`.
    pub fn restrict(&self, lo: i64, hi: i64) -> Interval {
        self.meet(&Interval::range(lo, hi))
    }
}

fn add_bound(a: i64, b: i64) -> i64 {
    if a == NEG_INF || b == NEG_INF {
        NEG_INF
    } else if a == POS_INF || b == POS_INF {
        POS_INF
    } else {
        a.saturating_add(b)
    }
}

impl Lattice for Interval {
    fn bottom() -> Self {
        Interval::Bot
    }

    fn top() -> Self {
        Interval::Range {
            lo: NEG_INF,
            hi: POS_INF,
        }
    }

    fn join(&self, other: &Self) -> Self {
        match (*self, *other) {
            (Interval::Bot, x) | (x, Interval::Bot) => x,
            (Interval::Range { lo: a, hi: b }, Interval::Range { lo: c, hi: d }) => {
                Interval::Range {
                    lo: a.min(c),
                    hi: b.max(d),
                }
            }
        }
    }

    fn meet(&self, other: &Self) -> Self {
        match (*self, *other) {
            (Interval::Range { lo: a, hi: b }, Interval::Range { lo: c, hi: d }) => {
                Interval::range(a.max(c), b.min(d))
            }
            _ => Interval::Bot,
        }
    }

    fn leq(&self, other: &Self) -> bool {
        match (*self, *other) {
            (Interval::Bot, _) => true,
            (_, Interval::Bot) => false,
            (Interval::Range { lo: a, hi: b }, Interval::Range { lo: c, hi: d }) => {
                c <= a && b <= d
            }
        }
    }
}

impl Widen for Interval {
    fn widen(&self, next: &Self) -> Self {
        match (*self, *next) {
            (Interval::Bot, x) | (x, Interval::Bot) => x,
            (Interval::Range { lo: a, hi: b }, Interval::Range { lo: c, hi: d }) => {
                Interval::Range {
                    lo: if c < a { NEG_INF } else { a },
                    hi: if d > b { POS_INF } else { b },
                }
            }
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Interval::Bot => write!(f, "⊥"),
            Interval::Range { lo, hi } => {
                let lo = if lo == NEG_INF {
                    "-∞".to_string()
                } else {
                    lo.to_string()
                };
                let hi = if hi == POS_INF {
                    "+∞".to_string()
                } else {
                    hi.to_string()
                };
                write!(f, "[{lo}, {hi}]")
            }
        }
    }
}
