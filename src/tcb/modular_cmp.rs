//! Comparisons over the 32-bit sequence number space. Two sequence numbers are
//! compared by the sign of their wrapping difference, so the comparisons hold
//! across the wraparound boundary as long as the values are within 2^31 of one
//! another.

/// The signed distance from `b` to `a`
const fn distance(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

/// a < b under modular arithmetic
pub const fn mod_lt(a: u32, b: u32) -> bool {
    distance(a, b) < 0
}

/// a <= b under modular arithmetic
pub const fn mod_leq(a: u32, b: u32) -> bool {
    distance(a, b) <= 0
}

/// a > b under modular arithmetic
pub const fn mod_gt(a: u32, b: u32) -> bool {
    distance(a, b) > 0
}

/// a >= b under modular arithmetic
pub const fn mod_geq(a: u32, b: u32) -> bool {
    distance(a, b) >= 0
}

/// low <= x < high under modular arithmetic
pub const fn in_window(x: u32, low: u32, high: u32) -> bool {
    mod_leq(low, x) && mod_lt(x, high)
}

/// Is `b` between `a` and `c` when accounting for modular arithmetic? Each
/// comparison can be strict or not.
pub fn mod_bounded(a: u32, ab_cmp: ModCmp, b: u32, bc_cmp: ModCmp, c: u32) -> bool {
    ab_cmp.holds(a, b) && bc_cmp.holds(b, c)
}

pub use ModCmp::*;
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModCmp {
    Lt,
    Leq,
}

impl ModCmp {
    fn holds(self, a: u32, b: u32) -> bool {
        match self {
            Lt => mod_lt(a, b),
            Leq => mod_leq(a, b),
        }
    }
}
