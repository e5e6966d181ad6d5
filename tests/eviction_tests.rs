//! Integration tests for the eviction policy as seen through the cache.

use volstream::cache::multi_queue::{MultiQueue, QueueTier};
use volstream::cache::residency::ResidencyCache;
use volstream::cache::slot::{EntrySlot, Reservation};
use volstream::config::CacheConfig;
use volstream::volume::block::BlockIndex;

/// Upload `values` and release them so they end up Cached.
fn cache_blocks(cache: &ResidencyCache, values: &[BlockIndex]) {
    let mut bracket = cache.acquire().unwrap();
    let reservations = bracket.reserve_for_write(values).unwrap();
    bracket.release();
    for reservation in reservations {
        if let Reservation::Upload(ticket) = reservation {
            cache.mark_uploaded(ticket).unwrap();
        }
    }
    for value in values {
        cache.release(*value).unwrap();
    }
}

/// Reserve `values` and return the blocks evicted to make room.
fn reserve_and_collect_evicted(cache: &ResidencyCache, values: &[BlockIndex]) -> Vec<BlockIndex> {
    let before: Vec<_> = cache.resident_entries().into_iter().map(|(_, v)| v).collect();
    cache_blocks(cache, values);
    let after: Vec<_> = cache.resident_entries().into_iter().map(|(_, v)| v).collect();
    before.into_iter().filter(|v| !after.contains(v)).collect()
}

#[test]
fn test_fine_levels_evicted_before_coarse() {
    let cache = ResidencyCache::with_slots(2, &CacheConfig::default());
    let coarse = BlockIndex::new(0, 0, 0, 3);
    let fine = BlockIndex::new(5, 5, 5, 0);
    cache_blocks(&cache, &[coarse, fine]);

    let evicted = reserve_and_collect_evicted(&cache, &[BlockIndex::new(6, 5, 5, 0)]);
    assert_eq!(evicted, vec![fine]);
    assert!(cache.query(coarse));
}

#[test]
fn test_lods_beyond_last_bucket_share_it() {
    let config = CacheConfig {
        priority_buckets: 2,
        ..Default::default()
    };
    let cache = ResidencyCache::with_slots(3, &config);
    let lod1 = BlockIndex::new(0, 0, 0, 1);
    let lod5 = BlockIndex::new(0, 0, 0, 5);
    let lod0 = BlockIndex::new(1, 0, 0, 0);
    cache_blocks(&cache, &[lod1, lod5, lod0]);

    let first = reserve_and_collect_evicted(&cache, &[BlockIndex::new(2, 0, 0, 0)]);
    assert_eq!(first, vec![lod0]);

    // Bucket 0 empties first, then lod1 and lod5 leave the shared top
    // bucket in admission order.
    let second = reserve_and_collect_evicted(
        &cache,
        &[BlockIndex::new(3, 0, 0, 0), BlockIndex::new(4, 0, 0, 0)],
    );
    assert_eq!(second.len(), 2);
    assert!(second.contains(&BlockIndex::new(2, 0, 0, 0)));
    assert!(second.contains(&lod1));
    assert!(cache.query(lod5));
}

#[test]
fn test_reused_block_outlives_one_shot_block() {
    let cache = ResidencyCache::with_slots(2, &CacheConfig::default());
    let reused = BlockIndex::new(0, 0, 0, 0);
    let one_shot = BlockIndex::new(1, 0, 0, 0);
    cache_blocks(&cache, &[reused, one_shot]);

    // Hit `reused` while it is Cached: it moves to the recency tier.
    let mut bracket = cache.acquire().unwrap();
    assert!(bracket.query_and_read_lock(&[reused]).unwrap()[0].hit());
    drop(bracket);
    cache.release(reused).unwrap();

    let evicted = reserve_and_collect_evicted(&cache, &[BlockIndex::new(2, 0, 0, 0)]);
    assert_eq!(evicted, vec![one_shot]);
}

#[test]
fn test_policy_scans_admission_then_recency() {
    let mut queue = MultiQueue::new(2, 4, 4);
    queue.insert(EntrySlot::new(0), 1, false).unwrap();
    queue.insert(EntrySlot::new(1), 0, true).unwrap();
    queue.insert(EntrySlot::new(2), 0, false).unwrap();

    assert_eq!(queue.position(EntrySlot::new(1)), Some((0, QueueTier::Recency)));
    assert_eq!(queue.evict().unwrap(), EntrySlot::new(2));
    assert_eq!(queue.evict().unwrap(), EntrySlot::new(1));
    assert_eq!(queue.evict().unwrap(), EntrySlot::new(0));
    assert!(queue.is_empty());
}
