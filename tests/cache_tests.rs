//! Integration tests for the residency cache under concurrent use.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use volstream::cache::residency::{CacheError, ResidencyCache};
use volstream::cache::slot::{Reservation, SlotState};
use volstream::config::CacheConfig;
use volstream::volume::block::BlockIndex;

fn cache(slots: u32) -> Arc<ResidencyCache> {
    Arc::new(ResidencyCache::with_slots(slots, &CacheConfig::default()))
}

/// Reserve `values` in one bracket and upload everything that needs it.
fn load(cache: &ResidencyCache, values: &[BlockIndex]) {
    let mut bracket = cache.acquire().unwrap();
    let reservations = bracket.reserve_for_write(values).unwrap();
    bracket.release();
    for reservation in reservations {
        if let Reservation::Upload(ticket) = reservation {
            cache.mark_uploaded(ticket).unwrap();
        }
    }
}

#[test]
fn test_block_lifecycle() {
    let cache = cache(4);
    let block = BlockIndex::new(1, 2, 3, 0);

    load(&cache, &[block]);
    assert!(matches!(
        cache.state(block),
        Some(SlotState::ReadLocked { readers: 1, .. })
    ));

    cache.release(block).unwrap();
    assert_eq!(cache.state(block), Some(SlotState::Cached(block)));

    // Second frame: a hit, no new upload.
    let mut bracket = cache.acquire().unwrap();
    let lookups = bracket.query_and_read_lock(&[block]).unwrap();
    drop(bracket);
    assert!(lookups[0].hit());
    cache.release(block).unwrap();

    let stats = cache.stats();
    assert_eq!(stats.uploads, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(cache.state_counts(), (3, 1, 0, 0));
}

#[test]
fn test_single_writer_per_block() {
    let cache = cache(8);
    let block = BlockIndex::new(0, 0, 0, 1);
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let writers = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let cache = cache.clone();
            let barrier = barrier.clone();
            let writers = writers.clone();
            thread::spawn(move || {
                barrier.wait();
                let mut bracket = cache.acquire().unwrap();
                let mut reservations = bracket.reserve_for_write(&[block]).unwrap();
                bracket.release();

                match reservations.pop().unwrap() {
                    Reservation::Upload(ticket) => {
                        writers.fetch_add(1, Ordering::SeqCst);
                        // Give the other threads time to find it WriteLocked.
                        thread::sleep(Duration::from_millis(10));
                        cache.mark_uploaded(ticket).unwrap();
                    }
                    Reservation::Resident { value, .. } => assert_eq!(value, block),
                }
                cache.release(block).unwrap();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(writers.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().uploads, 1);
    assert_eq!(cache.state(block), Some(SlotState::Cached(block)));
}

#[test]
fn test_reserve_waits_for_release() {
    let cache = cache(1);
    let held = BlockIndex::new(0, 0, 0, 0);
    let wanted = BlockIndex::new(1, 0, 0, 0);
    load(&cache, &[held]);

    let waiter = {
        let cache = cache.clone();
        thread::spawn(move || {
            let mut bracket = cache.acquire().unwrap();
            let reservations = bracket.reserve_for_write(&[wanted]).unwrap();
            bracket.release();
            reservations
        })
    };

    thread::sleep(Duration::from_millis(30));
    assert!(!waiter.is_finished());
    cache.release(held).unwrap();

    let reservations = waiter.join().unwrap();
    assert!(reservations[0].needs_upload());
    assert!(!cache.query(held));
    assert_eq!(cache.stats().evictions, 1);
}

#[test]
fn test_waiter_takes_over_abandoned_block() {
    let cache = cache(2);
    let block = BlockIndex::new(3, 3, 3, 0);

    let mut bracket = cache.acquire().unwrap();
    let ticket = match bracket.reserve_for_write(&[block]).unwrap().pop().unwrap() {
        Reservation::Upload(ticket) => ticket,
        Reservation::Resident { .. } => panic!("fresh block cannot be resident"),
    };
    bracket.release();

    let waiter = {
        let cache = cache.clone();
        thread::spawn(move || {
            let mut bracket = cache.acquire().unwrap();
            let reservations = bracket.reserve_for_write(&[block]).unwrap();
            bracket.release();
            reservations
        })
    };

    thread::sleep(Duration::from_millis(30));
    cache.abandon(ticket).unwrap();

    let mut reservations = waiter.join().unwrap();
    match reservations.pop().unwrap() {
        Reservation::Upload(ticket) => cache.mark_uploaded(ticket).unwrap(),
        Reservation::Resident { .. } => panic!("abandoned block must be re-reserved"),
    }
    assert!(matches!(
        cache.state(block),
        Some(SlotState::ReadLocked { readers: 1, .. })
    ));
}

#[test]
fn test_batch_larger_than_cache() {
    let cache = cache(2);
    let values: Vec<_> = (0..3).map(|x| BlockIndex::new(x, 0, 0, 0)).collect();

    let mut bracket = cache.acquire().unwrap();
    let err = bracket.reserve_for_write(&values).unwrap_err();
    drop(bracket);

    assert_eq!(err, CacheError::CapacityExceeded { capacity: 2 });
    assert_eq!(cache.state_counts(), (2, 0, 0, 0));
    assert!(cache.resident_entries().is_empty());
}

#[test]
fn test_bracket_serializes_across_threads() {
    let cache = cache(1);
    let bracket = cache.acquire().unwrap();

    let other = {
        let cache = cache.clone();
        thread::spawn(move || {
            // Blocks until the main thread's bracket ends.
            cache.acquire().map(|_| ()).is_ok()
        })
    };

    thread::sleep(Duration::from_millis(20));
    assert!(!other.is_finished());
    drop(bracket);
    assert!(other.join().unwrap());

    // Re-acquiring after release on the same thread is fine.
    assert!(cache.acquire().is_ok());
}
