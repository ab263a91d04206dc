//! # Consistent Hash Ring
//!
//! Maps destination keys to physical shards through virtual nodes.
//!
//! Each shard owns `virtual_nodes` positions at
//! `keccak256("shard-{id}-vnode-{i}")`. A key belongs to the first virtual
//! node clockwise from its own position. Adding a shard only moves keys that
//! land on the new shard's arcs (about `1/(N+1)` of them); naive
//! `hash % N` would move nearly all of them.
//!
//! The ring is immutable once built. Topology changes build a fresh ring and
//! swap it in whole.

use std::collections::BTreeSet;

use super::hashing::ring_position;
use crate::domain::ShardId;

/// Immutable consistent-hash ring.
#[derive(Clone, Debug)]
pub struct ConsistentHashRing {
    /// Sorted (position, shard) pairs.
    ring: Vec<(u64, ShardId)>,
    /// Distinct physical shards.
    shards: Vec<ShardId>,
    virtual_nodes: usize,
}

impl ConsistentHashRing {
    /// Build a ring over `shards` (duplicates ignored).
    pub fn build(shards: &[ShardId], virtual_nodes: usize) -> Self {
        let unique: BTreeSet<ShardId> = shards.iter().copied().collect();
        let vnodes = virtual_nodes.max(1);

        let mut ring = Vec::with_capacity(unique.len() * vnodes);
        for &shard in &unique {
            for vnode in 0..vnodes {
                let node_key = format!("shard-{}-vnode-{}", shard, vnode);
                ring.push((ring_position(node_key.as_bytes()), shard));
            }
        }
        // Ties on position resolve by shard id so the order never depends on input order
        ring.sort_unstable();

        Self {
            ring,
            shards: unique.into_iter().collect(),
            virtual_nodes: vnodes,
        }
    }

    /// Owning shard and the owning virtual node's position.
    pub fn locate(&self, key: &[u8]) -> Option<(ShardId, u64)> {
        let idx = self.successor_index(ring_position(key))?;
        let (pos, shard) = self.ring[idx];
        Some((shard, pos))
    }

    /// Owning shard for `key`.
    pub fn route(&self, key: &[u8]) -> Option<ShardId> {
        self.locate(key).map(|(shard, _)| shard)
    }

    /// First shard clockwise from `key` that is not excluded.
    ///
    /// Used to pick a failover candidate when the owner is unhealthy.
    pub fn next_shard(&self, key: &[u8], exclude: &[ShardId]) -> Option<ShardId> {
        let start = self.successor_index(ring_position(key))?;
        let len = self.ring.len();
        (0..len)
            .map(|step| self.ring[(start + step) % len].1)
            .find(|shard| !exclude.contains(shard))
    }

    /// Physical shards in ascending id order.
    pub fn shards(&self) -> &[ShardId] {
        &self.shards
    }

    /// Whether `shard` is part of this ring.
    pub fn contains(&self, shard: ShardId) -> bool {
        self.shards.binary_search(&shard).is_ok()
    }

    /// Number of physical shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Number of virtual nodes on the ring.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// True when no shards are present.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Virtual nodes per shard this ring was built with.
    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    /// New ring with `shard` added.
    pub fn with_shard(&self, shard: ShardId) -> Self {
        let mut shards = self.shards.clone();
        shards.push(shard);
        Self::build(&shards, self.virtual_nodes)
    }

    /// New ring with `shard` removed.
    pub fn without_shard(&self, shard: ShardId) -> Self {
        let shards: Vec<ShardId> = self.shards.iter().copied().filter(|&s| s != shard).collect();
        Self::build(&shards, self.virtual_nodes)
    }

    fn successor_index(&self, position: u64) -> Option<usize> {
        if self.ring.is_empty() {
            return None;
        }
        let idx = self.ring.partition_point(|&(pos, _)| pos < position);
        Some(if idx == self.ring.len() { 0 } else { idx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: u32) -> Vec<u8> {
        format!("account-{}", i).into_bytes()
    }

    #[test]
    fn test_route_deterministic() {
        let ring = ConsistentHashRing::build(&[0, 1, 2, 3], 150);
        for i in 0..100 {
            assert_eq!(ring.route(&key(i)), ring.route(&key(i)));
        }
    }

    #[test]
    fn test_build_order_independent() {
        let a = ConsistentHashRing::build(&[3, 1, 2, 0], 64);
        let b = ConsistentHashRing::build(&[0, 1, 2, 3, 3], 64);
        assert_eq!(a.len(), 4 * 64);
        for i in 0..200 {
            assert_eq!(a.route(&key(i)), b.route(&key(i)));
        }
    }

    #[test]
    fn test_empty_ring() {
        let ring = ConsistentHashRing::build(&[], 150);
        assert!(ring.is_empty());
        assert_eq!(ring.route(b"anything"), None);
        assert_eq!(ring.next_shard(b"anything", &[]), None);
    }

    #[test]
    fn test_single_shard_owns_everything() {
        let ring = ConsistentHashRing::build(&[7], 16);
        for i in 0..50 {
            assert_eq!(ring.route(&key(i)), Some(7));
        }
    }

    #[test]
    fn test_next_shard_skips_excluded() {
        let ring = ConsistentHashRing::build(&[0, 1, 2], 32);
        for i in 0..50 {
            let owner = ring.route(&key(i)).unwrap();
            let fallback = ring.next_shard(&key(i), &[owner]).unwrap();
            assert_ne!(owner, fallback);
            assert_eq!(ring.next_shard(&key(i), &[]), Some(owner));
        }
        assert_eq!(ring.next_shard(b"k", &[0, 1, 2]), None);
    }

    #[test]
    fn test_distribution_is_reasonably_even() {
        let ring = ConsistentHashRing::build(&[0, 1, 2, 3], 150);
        let mut counts = [0usize; 4];
        for i in 0..8_000 {
            counts[ring.route(&key(i)).unwrap() as usize] += 1;
        }
        // 2000 expected per shard; 150 vnodes keeps the spread well inside 2x
        for c in counts {
            assert!(c > 1_000 && c < 3_000, "uneven distribution: {:?}", counts);
        }
    }

    #[test]
    fn test_add_shard_moves_keys_only_to_new_shard() {
        let before = ConsistentHashRing::build(&[0, 1, 2, 3], 150);
        let after = before.with_shard(4);
        for i in 0..2_000 {
            let old = before.route(&key(i)).unwrap();
            let new = after.route(&key(i)).unwrap();
            assert!(old == new || new == 4, "key {} moved {} -> {}", i, old, new);
        }
    }

    #[test]
    fn test_remove_shard_moves_only_its_keys() {
        let before = ConsistentHashRing::build(&[0, 1, 2, 3], 150);
        let after = before.without_shard(2);
        assert!(!after.contains(2));
        for i in 0..2_000 {
            let old = before.route(&key(i)).unwrap();
            let new = after.route(&key(i)).unwrap();
            if old != 2 {
                assert_eq!(old, new);
            }
        }
    }
}
