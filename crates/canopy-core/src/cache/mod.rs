//! KV cache bookkeeping: a slot pool and a radix prefix cache.
//!
//! This module tracks KV memory at the granularity of one token:
//! - Fixed-capacity slot pool with all-or-nothing allocation
//! - Radix tree mapping token prefixes to the slots that hold their KV
//! - Reference counting so prefixes in use are never reclaimed
//!
//! # Architecture
//!
//! The KV cache is organized into two layers:
//!
//! 1. **Slot Pool** - Owns every slot; the only place slots are freed
//! 2. **Radix Cache** - Borrows slots for committed prefixes and hands them
//!    back through the pool on eviction
//!
//! Every allocated slot is owned by exactly one of: a radix node edge, or
//! the uncommitted tail of a live request.
//!
//! # Example
//!
//! ```rust
//! use canopy_core::cache::{RadixCache, SlotPool};
//!
//! let mut pool = SlotPool::new(8).unwrap();
//! let mut cache = RadixCache::new();
//!
//! let slots = pool.alloc(3).unwrap();
//! cache.insert(&[10, 11, 12], &slots).unwrap();
//!
//! // Everything is accounted for
//! assert_eq!(pool.available() + cache.total_slots(), 8);
//! ```

mod pool;
mod radix;
mod slot;

pub use pool::SlotPool;
pub use radix::{NodeId, NodeInfo, PrefixMatch, RadixCache, RadixCacheStats};
pub use slot::SlotId;

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    prop_compose! {
        fn arb_sequences()(
            seqs in prop::collection::vec(prop::collection::vec(0u32..4, 1..12), 1..12),
        ) -> Vec<Vec<u32>> {
            seqs
        }
    }

    fn commit(cache: &mut RadixCache, pool: &mut SlotPool, tokens: &[u32]) -> Option<Vec<SlotId>> {
        let hit = cache.match_prefix(tokens);
        let mut slots = hit.slots;
        let fresh = pool.alloc(tokens.len() - slots.len()).ok()?;
        slots.extend(fresh);
        let rejected = cache.insert(tokens, &slots).unwrap();
        pool.free(&rejected).unwrap();
        Some(slots)
    }

    proptest! {
        /// Invariant: free slots + tree slots == capacity when no request owns slots
        #[test]
        fn invariant_slot_conservation(seqs in arb_sequences(), evict in 0usize..40) {
            let mut pool = SlotPool::new(64).unwrap();
            let mut cache = RadixCache::new();

            for seq in &seqs {
                if commit(&mut cache, &mut pool, seq).is_none() {
                    cache.evict(seq.len(), &mut pool).unwrap();
                }
                prop_assert_eq!(pool.available() + cache.total_slots(), 64);
            }

            cache.evict(evict, &mut pool).unwrap();
            prop_assert_eq!(pool.available() + cache.total_slots(), 64);
            cache.validate().unwrap();
        }

        /// Invariant: no slot is held twice, and every tree slot is allocated
        #[test]
        fn invariant_unique_slot_ownership(seqs in arb_sequences()) {
            let mut pool = SlotPool::new(256).unwrap();
            let mut cache = RadixCache::new();

            for seq in &seqs {
                commit(&mut cache, &mut pool, seq);
            }

            let slots = cache.all_slots();
            let unique: HashSet<_> = slots.iter().collect();
            prop_assert_eq!(unique.len(), slots.len());
            for slot in &slots {
                prop_assert!(pool.is_allocated(*slot));
            }
        }

        /// Round trip: insert then match returns the slots the tree kept
        #[test]
        fn insert_then_match_round_trip(seqs in arb_sequences()) {
            let mut pool = SlotPool::new(256).unwrap();
            let mut cache = RadixCache::new();

            for seq in &seqs {
                let kept = commit(&mut cache, &mut pool, seq).unwrap();
                let hit = cache.match_prefix(seq);
                prop_assert_eq!(hit.slots, kept);
            }
        }

        /// Invariant: pinned prefixes survive any eviction
        #[test]
        fn invariant_pinned_prefix_survives(seqs in arb_sequences(), pick in any::<prop::sample::Index>()) {
            let mut pool = SlotPool::new(256).unwrap();
            let mut cache = RadixCache::new();

            for seq in &seqs {
                commit(&mut cache, &mut pool, seq);
            }

            let pinned = pick.get(&seqs);
            let hit = cache.match_prefix(pinned);
            cache.inc_ref(hit.last_node).unwrap();

            cache.evict(usize::MAX, &mut pool).unwrap();
            prop_assert_eq!(cache.match_prefix(pinned).slots, hit.slots.clone());
            prop_assert_eq!(cache.protected_slots(), cache.total_slots());

            cache.dec_ref(hit.last_node).unwrap();
            cache.evict(usize::MAX, &mut pool).unwrap();
            prop_assert!(cache.is_empty());
            prop_assert_eq!(pool.available(), 256);
        }
    }
}
