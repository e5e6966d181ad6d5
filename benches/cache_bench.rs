//! Benchmarks for the residency cache and octree queries.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use glam::{UVec3, Vec3};

use volstream::cache::multi_queue::MultiQueue;
use volstream::cache::residency::ResidencyCache;
use volstream::cache::slot::{EntrySlot, Reservation};
use volstream::config::CacheConfig;
use volstream::index::geometry::{Aabb, ViewRegion};
use volstream::index::octree::LodOctree;
use volstream::volume::block::BlockIndex;

fn bench_reserve_release(c: &mut Criterion) {
    // 1024 slots, 4096 distinct blocks: steady-state eviction.
    let cache = ResidencyCache::with_slots(1024, &CacheConfig::default());
    let values: Vec<BlockIndex> = (0..4096)
        .map(|i| BlockIndex::new(i % 16, (i / 16) % 16, i / 256, i % 4))
        .collect();
    let mut cursor = 0usize;

    c.bench_function("reserve_upload_release_256", |b| {
        b.iter(|| {
            let batch = &values[cursor..cursor + 256];
            cursor = (cursor + 256) % values.len();

            let mut bracket = cache.acquire().unwrap();
            let reservations = bracket.reserve_for_write(black_box(batch)).unwrap();
            bracket.release();
            for reservation in reservations {
                if let Reservation::Upload(ticket) = reservation {
                    cache.mark_uploaded(ticket).unwrap();
                }
            }
            for value in batch {
                cache.release(*value).unwrap();
            }
        })
    });
}

fn bench_multi_queue(c: &mut Criterion) {
    c.bench_function("multi_queue_insert_evict_10k", |b| {
        b.iter(|| {
            let mut queue = MultiQueue::new(4, 1024, 2048);
            for i in 0..10_000u32 {
                queue
                    .insert(EntrySlot::new(i), (i % 4) as usize, i % 3 == 0)
                    .unwrap();
            }
            while let Ok(slot) = queue.evict() {
                black_box(slot);
            }
        })
    });
}

fn bench_octree_queries(c: &mut Criterion) {
    // 2048^3 volume, 64^3 blocks: 32768 leaves.
    let tree = LodOctree::build_grid(UVec3::splat(2048), 64, Vec3::ONE);
    let region = ViewRegion::Box(Aabb::new(Vec3::splat(100.0), Vec3::splat(1500.0)));

    c.bench_function("octree_query_level0_partial", |b| {
        b.iter(|| black_box(tree.query_level(black_box(&region), 0)))
    });

    c.bench_function("octree_query_lod_partial", |b| {
        b.iter(|| {
            black_box(tree.query_lod(
                black_box(&region),
                Vec3::ZERO,
                &[256.0, 512.0, 1024.0, 2048.0],
            ))
        })
    });
}

criterion_group!(
    benches,
    bench_reserve_release,
    bench_multi_queue,
    bench_octree_queries,
);
criterion_main!(benches);
