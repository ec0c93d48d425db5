// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Multiplicative hashing helpers.

pub const GOLDEN_RATIO_64: u64 = 0x61C8_8646_80B5_83EB;

/// Hash `val` down to `bits` bits.
pub fn hash_long(val: u64, bits: u32) -> u64 {
    if bits == 0 {
        return 0;
    }
    let bits = bits.min(64);
    val.wrapping_mul(GOLDEN_RATIO_64) >> (64 - bits)
}

/// Number of bits needed to index `n` buckets, i.e. `ceil(log2(n))`.
pub fn order_base_2(n: usize) -> u32 {
    if n <= 1 {
        0
    } else {
        usize::BITS - (n - 1).leading_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_long_range() {
        for key in [0u64, 1, 12345, u64::MAX, 0x2000_0000_c0a8_0001] {
            assert!(hash_long(key, 3) < 8);
            assert_eq!(hash_long(key, 0), 0);
        }
        assert_eq!(hash_long(7, 64), 7u64.wrapping_mul(GOLDEN_RATIO_64));
    }

    #[test]
    fn test_order_base_2() {
        assert_eq!(order_base_2(1), 0);
        assert_eq!(order_base_2(2), 1);
        assert_eq!(order_base_2(5), 3);
        assert_eq!(order_base_2(8), 3);
    }
}
