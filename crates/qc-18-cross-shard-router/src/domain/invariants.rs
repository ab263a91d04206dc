//! # Domain Invariants
//!
//! Rules the router must never break. The service layer checks them with
//! `debug_assert!` on hot paths; tests check them directly.

use super::entities::Batch;

/// Maximum virtual nodes per physical shard.
pub const MAX_VIRTUAL_NODES: usize = 4096;

/// Invariant: a sealed batch respects the configured bounds.
///
/// Final batches produced while draining and replayed batches may be
/// smaller than `min`, never empty and never larger than `max`.
pub fn invariant_batch_bounds(batch: &Batch, max: usize) -> bool {
    !batch.is_empty() && batch.len() <= max
}

/// Invariant: batch sequence numbers strictly increase per route.
pub fn invariant_monotonic_seq(previous: Option<u64>, next: u64) -> bool {
    previous.is_none_or(|p| next > p)
}

/// Invariant: total queued messages never exceed route capacity.
///
/// Recovery and topology re-homing may restore beyond capacity; everything
/// admitted through `submit` respects it.
pub fn invariant_capacity(depth: usize, capacity: usize) -> bool {
    depth <= capacity
}

/// Invariant: every key moved by a topology change moved onto an added shard.
pub fn invariant_minimal_remap<T: PartialEq>(before: &T, after: &T, added: &[T]) -> bool {
    before == after || added.contains(after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Message, Priority};

    #[test]
    fn test_batch_bounds() {
        let msg = Message::new(0, b"k".to_vec(), Priority::Low, b"p".to_vec());
        let batch = Batch::seal(1, 0, vec![msg.clone(), msg]);
        assert!(invariant_batch_bounds(&batch, 2));
        assert!(!invariant_batch_bounds(&batch, 1));
        assert!(!invariant_batch_bounds(&Batch::seal(2, 0, Vec::new()), 8));
    }

    #[test]
    fn test_monotonic_seq() {
        assert!(invariant_monotonic_seq(None, 0));
        assert!(invariant_monotonic_seq(Some(4), 5));
        assert!(!invariant_monotonic_seq(Some(5), 5));
    }

    #[test]
    fn test_minimal_remap() {
        assert!(invariant_minimal_remap(&1u16, &1, &[4]));
        assert!(invariant_minimal_remap(&1u16, &4, &[4]));
        assert!(!invariant_minimal_remap(&1u16, &2, &[4]));
    }
}
