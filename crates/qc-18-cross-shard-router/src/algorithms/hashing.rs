//! Hash functions for ring placement and the dedup filter.
//!
//! Ring positions use keccak256 so placement is stable across builds and
//! platforms. The bloom filter uses MurmurHash3 with double hashing.

use std::io::Cursor;

use sha3::{Digest, Keccak256};

/// keccak256 of `data`.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

/// 64-bit ring position of arbitrary bytes (first 8 bytes of keccak256, BE).
pub fn ring_position(data: &[u8]) -> u64 {
    let hash = keccak256(data);
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash[..8]);
    u64::from_be_bytes(head)
}

/// Hash an element with MurmurHash3 using a seed and tweak.
///
/// The tweak distinguishes dedup generations so a hot bit pattern in one
/// generation does not repeat in the next.
pub fn murmur_hash(element: &[u8], seed: u32, tweak: u32) -> u64 {
    let combined_seed = seed.wrapping_add(tweak);
    let mut cursor = Cursor::new(element);
    let hash = murmur3::murmur3_x64_128(&mut cursor, combined_seed).unwrap_or(0);
    hash as u64
}

/// Compute k bit positions in `[0, m)` using h(i) = h1 + i * h2.
pub fn compute_hash_positions(element: &[u8], k: usize, m: usize, tweak: u32) -> Vec<usize> {
    let h1 = murmur_hash(element, 0, tweak);
    let h2 = murmur_hash(element, 1, tweak);

    (0..k)
        .map(|i| {
            let hash = h1.wrapping_add((i as u64).wrapping_mul(h2));
            (hash % m as u64) as usize
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_position_deterministic() {
        assert_eq!(ring_position(b"shard-1-vnode-0"), ring_position(b"shard-1-vnode-0"));
        assert_ne!(ring_position(b"shard-1-vnode-0"), ring_position(b"shard-1-vnode-1"));
    }

    #[test]
    fn test_murmur_tweak_changes_output() {
        let element = b"fingerprint";
        assert_ne!(murmur_hash(element, 0, 0), murmur_hash(element, 0, 1));
        assert_eq!(murmur_hash(element, 3, 9), murmur_hash(element, 3, 9));
    }

    #[test]
    fn test_positions_in_range() {
        let positions = compute_hash_positions(b"element", 7, 1000, 0);
        assert_eq!(positions.len(), 7);
        assert!(positions.iter().all(|&p| p < 1000));
    }
}
