/// Difficulty / target arithmetic.
///
/// Targets are 256-bit unsigned integers held as big-endian byte arrays;
/// difficulty is a positive u64. All conversions are explicit long division
/// with saturation at the edges - no wraparound arithmetic anywhere.
use crate::hash::Hash;

/// Difficulty-1 target: every possible digest qualifies.
pub const MAX_TARGET: Hash = [0xff; 32];

/// floor((2^256 - 1) / difficulty), computed by base-256 long division over
/// the big-endian limbs. Difficulty 0 is treated as 1.
pub fn target_from_difficulty(difficulty: u64) -> Hash {
    let mut out = MAX_TARGET;
    if difficulty <= 1 {
        return out;
    }
    let div = difficulty as u128;
    let mut rem: u128 = 0;
    for byte in out.iter_mut() {
        let acc: u128 = (rem << 8) | (*byte as u128);
        *byte = (acc / div) as u8;
        rem = acc % div;
    }
    out
}

/// Big-endian numeric comparison: a digest wins when it is at or below the
/// target. Byte-array lexicographic order is exactly big-endian numeric order.
pub fn meets_target(hash: &Hash, target: &Hash) -> bool {
    hash <= target
}
