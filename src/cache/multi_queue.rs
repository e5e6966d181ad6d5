//! Multi-queue eviction policy for Cached slots.
//!
//! Slots are grouped into priority buckets keyed by clamped LOD. Each bucket
//! is a two-tier cache:
//! - an admission FIFO for slots cached once and never re-used
//! - a recency (LRU) tier for slots that were hit while cached
//!
//! Overflowing a tier demotes its oldest slot into the same tier one bucket
//! down, cascading toward bucket 0, which absorbs any overflow. Victims are
//! taken from the lowest bucket first, admission tier before recency tier,
//! so fine detail blocks are reclaimed before coarse overview blocks.

use std::collections::{BTreeMap, HashMap};

use tracing::trace;

use crate::cache::residency::CacheError;
use crate::cache::slot::EntrySlot;

/// Which tier of a bucket a slot sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueTier {
    Admission,
    Recency,
}

/// One bucket: both tiers ordered by tick (oldest first).
#[derive(Debug, Default)]
struct Bucket {
    admission: BTreeMap<u64, EntrySlot>,
    recency: BTreeMap<u64, EntrySlot>,
}

impl Bucket {
    fn tier_mut(&mut self, tier: QueueTier) -> &mut BTreeMap<u64, EntrySlot> {
        match tier {
            QueueTier::Admission => &mut self.admission,
            QueueTier::Recency => &mut self.recency,
        }
    }

    fn len(&self) -> usize {
        self.admission.len() + self.recency.len()
    }
}

#[derive(Debug, Clone, Copy)]
struct Position {
    bucket: usize,
    tier: QueueTier,
    tick: u64,
}

/// The multi-queue policy.
#[derive(Debug)]
pub struct MultiQueue {
    buckets: Vec<Bucket>,
    positions: HashMap<EntrySlot, Position>,
    admission_capacity: usize,
    recency_capacity: usize,
    next_tick: u64,
}

impl MultiQueue {
    /// Create a policy with `bucket_count` buckets.
    ///
    /// Capacities are per bucket and per tier.
    pub fn new(bucket_count: usize, admission_capacity: usize, recency_capacity: usize) -> Self {
        Self {
            buckets: (0..bucket_count.max(1)).map(|_| Bucket::default()).collect(),
            positions: HashMap::new(),
            admission_capacity: admission_capacity.max(1),
            recency_capacity: recency_capacity.max(1),
            next_tick: 0,
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket for a level of detail, clamped into range.
    pub fn priority_for_lod(&self, lod: i32) -> usize {
        lod.clamp(0, self.buckets.len() as i32 - 1) as usize
    }

    /// Insert a Cached slot.
    ///
    /// `confirmed` slots were re-used while cached and go to the recency tier.
    pub fn insert(
        &mut self,
        slot: EntrySlot,
        priority: usize,
        confirmed: bool,
    ) -> Result<(), CacheError> {
        if priority >= self.buckets.len() {
            return Err(CacheError::PriorityOutOfRange {
                priority,
                buckets: self.buckets.len(),
            });
        }
        if self.positions.contains_key(&slot) {
            return Err(CacheError::AlreadyQueued(slot));
        }
        let tier = if confirmed {
            QueueTier::Recency
        } else {
            QueueTier::Admission
        };
        self.place(slot, priority, tier);
        Ok(())
    }

    /// Remove a slot that is leaving the Cached state.
    pub fn remove(&mut self, slot: EntrySlot) -> bool {
        match self.positions.remove(&slot) {
            Some(pos) => {
                self.buckets[pos.bucket].tier_mut(pos.tier).remove(&pos.tick);
                true
            }
            None => false,
        }
    }

    /// Take the next victim, scanning buckets from lowest priority up.
    pub fn evict(&mut self) -> Result<EntrySlot, CacheError> {
        for bucket in &mut self.buckets {
            let victim = bucket
                .admission
                .pop_first()
                .or_else(|| bucket.recency.pop_first());
            if let Some((_, slot)) = victim {
                self.positions.remove(&slot);
                return Ok(slot);
            }
        }
        Err(CacheError::EmptyEviction)
    }

    /// Where a slot currently sits.
    pub fn position(&self, slot: EntrySlot) -> Option<(usize, QueueTier)> {
        self.positions.get(&slot).map(|p| (p.bucket, p.tier))
    }

    pub fn bucket_len(&self, priority: usize) -> usize {
        self.buckets.get(priority).map(Bucket::len).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn capacity(&self, tier: QueueTier) -> usize {
        match tier {
            QueueTier::Admission => self.admission_capacity,
            QueueTier::Recency => self.recency_capacity,
        }
    }

    fn place(&mut self, slot: EntrySlot, priority: usize, tier: QueueTier) {
        let capacity = self.capacity(tier);
        let mut current = Some((slot, priority));

        while let Some((slot, bucket)) = current.take() {
            let tick = self.next_tick;
            self.next_tick += 1;
            let queue = self.buckets[bucket].tier_mut(tier);
            queue.insert(tick, slot);
            self.positions.insert(slot, Position { bucket, tier, tick });

            if bucket > 0 && queue.len() > capacity {
                if let Some((_, oldest)) = queue.pop_first() {
                    trace!(%oldest, from = bucket, to = bucket - 1, "Demoted cached slot");
                    current = Some((oldest, bucket - 1));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(id: u32) -> EntrySlot {
        EntrySlot::new(id)
    }

    #[test]
    fn test_evicts_lowest_bucket_first() {
        let mut mq = MultiQueue::new(4, 8, 8);
        mq.insert(s(1), 3, false).unwrap();
        mq.insert(s(2), 0, false).unwrap();
        mq.insert(s(3), 2, false).unwrap();

        assert_eq!(mq.evict().unwrap(), s(2));
        assert_eq!(mq.evict().unwrap(), s(3));
        assert_eq!(mq.evict().unwrap(), s(1));
        assert!(mq.is_empty());
    }

    #[test]
    fn test_admission_before_recency_within_bucket() {
        let mut mq = MultiQueue::new(2, 8, 8);
        mq.insert(s(1), 1, true).unwrap();
        mq.insert(s(2), 1, false).unwrap();

        assert_eq!(mq.evict().unwrap(), s(2));
        assert_eq!(mq.evict().unwrap(), s(1));
    }

    #[test]
    fn test_overflow_demotes_cascading() {
        let mut mq = MultiQueue::new(3, 1, 1);
        mq.insert(s(1), 2, false).unwrap();
        mq.insert(s(2), 2, false).unwrap();
        // s(1) demoted to bucket 1.
        assert_eq!(mq.position(s(1)), Some((1, QueueTier::Admission)));

        mq.insert(s(3), 2, false).unwrap();
        // s(2) demoted to bucket 1, pushing s(1) into bucket 0.
        assert_eq!(mq.position(s(2)), Some((1, QueueTier::Admission)));
        assert_eq!(mq.position(s(1)), Some((0, QueueTier::Admission)));
        assert_eq!(mq.len(), 3);

        // Bucket 0 absorbs overflow.
        mq.insert(s(4), 0, false).unwrap();
        assert_eq!(mq.bucket_len(0), 2);
        assert_eq!(mq.evict().unwrap(), s(1));
    }

    #[test]
    fn test_protocol_violations() {
        let mut mq = MultiQueue::new(2, 4, 4);
        assert!(matches!(mq.evict(), Err(CacheError::EmptyEviction)));
        assert!(matches!(
            mq.insert(s(1), 2, false),
            Err(CacheError::PriorityOutOfRange { priority: 2, buckets: 2 })
        ));
        mq.insert(s(1), 0, false).unwrap();
        assert!(matches!(
            mq.insert(s(1), 1, false),
            Err(CacheError::AlreadyQueued(_))
        ));
    }

    #[test]
    fn test_remove() {
        let mut mq = MultiQueue::new(2, 4, 4);
        mq.insert(s(1), 1, false).unwrap();
        assert!(mq.remove(s(1)));
        assert!(!mq.remove(s(1)));
        assert!(mq.is_empty());
    }

    #[test]
    fn test_priority_clamp() {
        let mq = MultiQueue::new(4, 4, 4);
        assert_eq!(mq.priority_for_lod(0), 0);
        assert_eq!(mq.priority_for_lod(7), 3);
        assert_eq!(mq.priority_for_lod(-2), 0);
    }
}
