//! Residency cache: the page table for GPU-resident blocks.
//!
//! Tracks, per slot, which block (if any) it holds and in which state:
//!
//! ```text
//!            reserve (free/evict)         mark_uploaded
//!   Free ─────────────────────────▶ WriteLocked ──────────▶ ReadLocked(1)
//!    ▲                                  │ abandon                │  ▲ query/reserve hit
//!    └──────────────────────────────────┘                release │  │
//!                                                 (readers == 0) ▼  │
//!   evicted by reserve ◀──────────────────────────────────────── Cached
//! ```
//!
//! Query-then-reserve decisions happen inside a [`CacheBracket`], a guard
//! that serializes batches across threads so two frames never both decide to
//! upload the same block. Uploads, releases and abandons happen outside the
//! bracket: a WriteLocked slot has exactly one [`WriteTicket`] holder.
//!
//! Locking: the free list, the priority buckets and the per-slot states
//! (ReadLocked refcounts, WriteLocked bindings) all live in one table behind
//! a single mutex, rather than one mutex per list. Every transition touches
//! at least two of them, so one lock keeps each transition atomic without a
//! lock order. The bracket is a separate mutex, never taken while the table
//! lock is held. Waiters park on two condvars over the table: `uploaded`
//! (a WriteLocked slot became ReadLocked or was abandoned) and `reclaimable`
//! (a slot became Cached or Free).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::cache::multi_queue::MultiQueue;
use crate::cache::slot::{EntrySlot, Lookup, Reservation, SlotState, WriteTicket};
use crate::config::CacheConfig;
use crate::volume::block::BlockIndex;

/// Protocol violations. Each indicates a caller breaking the state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache bracket already held by this thread")]
    ReentrantAcquire,

    #[error("{0} is already registered")]
    DuplicateSlot(EntrySlot),

    #[error("{0} is already queued for eviction")]
    AlreadyQueued(EntrySlot),

    #[error("Eviction requested from an empty queue")]
    EmptyEviction,

    #[error("Priority {priority} out of range ({buckets} buckets)")]
    PriorityOutOfRange { priority: usize, buckets: usize },

    #[error("Block {0} is not locked")]
    NotLocked(BlockIndex),

    #[error("Block {0} is not WriteLocked by this ticket")]
    NotWriteLocked(BlockIndex),

    #[error("Invalid block index {0}")]
    InvalidBlockIndex(BlockIndex),

    #[error("Batch needs more than the {capacity} slots in the cache")]
    CapacityExceeded { capacity: usize },
}

/// Lock-free counters for monitoring.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    uploads: AtomicU64,
    evictions: AtomicU64,
    waits: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub uploads: u64,
    pub evictions: u64,
    pub waits: u64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-slot bookkeeping.
#[derive(Debug)]
struct SlotRecord {
    state: SlotState,
    /// Hit while cached since it was last bound.
    confirmed: bool,
}

/// Everything guarded by the table lock.
struct ResidencyTable {
    slots: HashMap<EntrySlot, SlotRecord>,
    bindings: HashMap<BlockIndex, EntrySlot>,
    free: VecDeque<EntrySlot>,
    policy: MultiQueue,
}

impl ResidencyTable {
    fn record_mut(&mut self, slot: EntrySlot) -> &mut SlotRecord {
        // Bindings and free-list entries always name registered slots.
        self.slots
            .get_mut(&slot)
            .unwrap_or_else(|| unreachable!("{slot} bound but not registered"))
    }

    fn state(&self, slot: EntrySlot) -> SlotState {
        self.slots
            .get(&slot)
            .map(|r| r.state)
            .unwrap_or(SlotState::Free)
    }

    fn bind(&mut self, value: BlockIndex, slot: EntrySlot) -> WriteTicket {
        self.bindings.insert(value, slot);
        let record = self.record_mut(slot);
        record.state = SlotState::WriteLocked(value);
        record.confirmed = false;
        WriteTicket::new(value, slot)
    }

    /// Take one more reader on a Cached or ReadLocked slot.
    ///
    /// Returns false if the slot is in neither state.
    fn read_lock(&mut self, value: BlockIndex, slot: EntrySlot) -> bool {
        match self.state(slot) {
            SlotState::ReadLocked { readers, .. } => {
                self.record_mut(slot).state = SlotState::ReadLocked {
                    value,
                    readers: readers + 1,
                };
                true
            }
            SlotState::Cached(_) => {
                self.policy.remove(slot);
                let record = self.record_mut(slot);
                record.state = SlotState::ReadLocked { value, readers: 1 };
                record.confirmed = true;
                true
            }
            _ => false,
        }
    }

    /// Drop one reader; returns true if the slot became Cached.
    fn release(&mut self, value: BlockIndex) -> Result<bool, CacheError> {
        let slot = *self
            .bindings
            .get(&value)
            .ok_or(CacheError::NotLocked(value))?;
        let priority = self.policy.priority_for_lod(value.lod);
        let record = self.record_mut(slot);
        let confirmed = record.confirmed;

        match record.state {
            SlotState::ReadLocked { readers, .. } if readers > 1 => {
                record.state = SlotState::ReadLocked {
                    value,
                    readers: readers - 1,
                };
                Ok(false)
            }
            SlotState::ReadLocked { .. } => {
                record.state = SlotState::Cached(value);
                self.policy.insert(slot, priority, confirmed)?;
                Ok(true)
            }
            _ => Err(CacheError::NotLocked(value)),
        }
    }

    /// The record of `slot`, provided it is WriteLocked for `value`.
    fn write_locked(
        &mut self,
        value: BlockIndex,
        slot: EntrySlot,
    ) -> Result<&mut SlotRecord, CacheError> {
        match self.slots.get_mut(&slot) {
            Some(record) if record.state == SlotState::WriteLocked(value) => Ok(record),
            _ => Err(CacheError::NotWriteLocked(value)),
        }
    }

    /// WriteLocked → Free.
    fn abandon(&mut self, value: BlockIndex, slot: EntrySlot) -> Result<(), CacheError> {
        let record = self.write_locked(value, slot)?;
        record.state = SlotState::Free;
        record.confirmed = false;
        self.bindings.remove(&value);
        self.free.push_back(slot);
        Ok(())
    }

    /// Evict the lowest-priority Cached slot and bind it to `value`.
    fn evict_into(&mut self, value: BlockIndex) -> Result<WriteTicket, CacheError> {
        let slot = self.policy.evict()?;
        if let Some(old) = self.state(slot).value() {
            self.bindings.remove(&old);
            debug!(evicted = %old, block = %value, %slot, "Evicted cached block");
        }
        Ok(self.bind(value, slot))
    }
}

/// The residency cache.
pub struct ResidencyCache {
    table: Mutex<ResidencyTable>,

    /// Signaled when a WriteLocked slot leaves that state.
    uploaded: Condvar,

    /// Signaled when a slot becomes Free or Cached.
    reclaimable: Condvar,

    bracket: Mutex<()>,
    bracket_owner: Mutex<Option<ThreadId>>,

    stats: CacheStats,
}

impl ResidencyCache {
    /// Create an empty cache; register slots with [`insert_free_slot`](Self::insert_free_slot).
    pub fn new(config: &CacheConfig) -> Self {
        let policy = MultiQueue::new(
            config.priority_buckets,
            config.admission_capacity,
            config.recency_capacity,
        );
        Self {
            table: Mutex::new(ResidencyTable {
                slots: HashMap::new(),
                bindings: HashMap::new(),
                free: VecDeque::new(),
                policy,
            }),
            uploaded: Condvar::new(),
            reclaimable: Condvar::new(),
            bracket: Mutex::new(()),
            bracket_owner: Mutex::new(None),
            stats: CacheStats::default(),
        }
    }

    /// Create a cache with slots `0..count` registered as Free.
    pub fn with_slots(count: u32, config: &CacheConfig) -> Self {
        let cache = Self::new(config);
        {
            let mut table = cache.table.lock();
            for id in 0..count {
                let slot = EntrySlot::new(id);
                table.slots.insert(
                    slot,
                    SlotRecord {
                        state: SlotState::Free,
                        confirmed: false,
                    },
                );
                table.free.push_back(slot);
            }
        }
        cache
    }

    /// Register a new Free slot.
    pub fn insert_free_slot(&self, slot: EntrySlot) -> Result<(), CacheError> {
        let mut table = self.table.lock();
        if table.slots.contains_key(&slot) {
            error!(%slot, "Slot registered twice");
            return Err(CacheError::DuplicateSlot(slot));
        }
        table.slots.insert(
            slot,
            SlotRecord {
                state: SlotState::Free,
                confirmed: false,
            },
        );
        table.free.push_back(slot);
        drop(table);

        self.reclaimable.notify_all();
        Ok(())
    }

    /// Enter the query+reserve critical section.
    ///
    /// Fails if the calling thread already holds the bracket.
    pub fn acquire(&self) -> Result<CacheBracket<'_>, CacheError> {
        let me = thread::current().id();
        if *self.bracket_owner.lock() == Some(me) {
            error!("Re-entrant cache bracket acquisition");
            return Err(CacheError::ReentrantAcquire);
        }
        let guard = self.bracket.lock();
        *self.bracket_owner.lock() = Some(me);

        Ok(CacheBracket {
            cache: self,
            _guard: guard,
            resolved: HashSet::new(),
        })
    }

    /// WriteLocked → ReadLocked(1), consuming the ticket.
    pub fn mark_uploaded(&self, ticket: WriteTicket) -> Result<(), CacheError> {
        let (value, slot) = (ticket.value(), ticket.slot());
        let mut table = self.table.lock();
        let state = table.state(slot);
        match table.write_locked(value, slot) {
            Ok(record) => record.state = SlotState::ReadLocked { value, readers: 1 },
            Err(e) => {
                error!(block = %value, %slot, state = state.name(), "mark_uploaded on slot not WriteLocked");
                return Err(e);
            }
        }
        drop(table);

        CacheStats::bump(&self.stats.uploads);
        trace!(block = %value, %slot, "Uploaded");
        self.uploaded.notify_all();
        Ok(())
    }

    /// Give up a write reservation: WriteLocked → Free.
    ///
    /// Reservers blocked on this block wake up and resolve it themselves.
    pub fn abandon(&self, ticket: WriteTicket) -> Result<(), CacheError> {
        let (value, slot) = (ticket.value(), ticket.slot());
        if let Err(e) = self.table.lock().abandon(value, slot) {
            error!(block = %value, %slot, "Abandon on slot not WriteLocked");
            return Err(e);
        }
        warn!(block = %value, %slot, "Write reservation abandoned");
        self.uploaded.notify_all();
        self.reclaimable.notify_all();
        Ok(())
    }

    /// Drop one reader reference. The last reader makes the slot Cached.
    pub fn release(&self, value: BlockIndex) -> Result<(), CacheError> {
        let became_cached = match self.table.lock().release(value) {
            Ok(cached) => cached,
            Err(e) => {
                error!(block = %value, error = %e, "Release of block that is not ReadLocked");
                return Err(e);
            }
        };
        if became_cached {
            trace!(block = %value, "Cached");
            self.reclaimable.notify_all();
        }
        Ok(())
    }

    /// Whether `value` is bound to a slot (Cached, ReadLocked or WriteLocked).
    pub fn query(&self, value: BlockIndex) -> bool {
        self.table.lock().bindings.contains_key(&value)
    }

    /// Current state of the slot bound to `value`, if any.
    pub fn state(&self, value: BlockIndex) -> Option<SlotState> {
        let table = self.table.lock();
        let slot = table.bindings.get(&value)?;
        table.slots.get(slot).map(|r| r.state)
    }

    /// All bound `(slot, block)` pairs.
    pub fn resident_entries(&self) -> Vec<(EntrySlot, BlockIndex)> {
        let table = self.table.lock();
        let mut entries: Vec<_> = table.bindings.iter().map(|(v, s)| (*s, *v)).collect();
        entries.sort();
        entries
    }

    /// Slot counts per state: `(free, cached, read_locked, write_locked)`.
    pub fn state_counts(&self) -> (usize, usize, usize, usize) {
        let table = self.table.lock();
        table.slots.values().fold((0, 0, 0, 0), |mut acc, r| {
            match r.state {
                SlotState::Free => acc.0 += 1,
                SlotState::Cached(_) => acc.1 += 1,
                SlotState::ReadLocked { .. } => acc.2 += 1,
                SlotState::WriteLocked(_) => acc.3 += 1,
            }
            acc
        })
    }

    pub fn slot_count(&self) -> usize {
        self.table.lock().slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.table.lock().free.len()
    }

    pub fn cached_count(&self) -> usize {
        self.table.lock().policy.len()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }
}

/// The acquire/release bracket around query+reserve.
///
/// Holds the cache's coarse lock; dropping (or [`release`](Self::release))
/// ends the critical section. No I/O or GPU work belongs inside it.
pub struct CacheBracket<'a> {
    cache: &'a ResidencyCache,
    _guard: MutexGuard<'a, ()>,
    /// Blocks this bracket already holds a lock on.
    resolved: HashSet<BlockIndex>,
}

impl<'a> CacheBracket<'a> {
    /// Read-lock every Cached or ReadLocked block in `values`.
    ///
    /// Misses (unbound or WriteLocked) are reported without a slot and
    /// allocate nothing.
    pub fn query_and_read_lock(&mut self, values: &[BlockIndex]) -> Result<Vec<Lookup>, CacheError> {
        // Reject the whole batch before any reader reference is taken.
        values.iter().copied().try_for_each(check_valid)?;

        let stats = &self.cache.stats;
        let mut table = self.cache.table.lock();
        let mut lookups = Vec::with_capacity(values.len());

        for &value in values {
            let Some(&slot) = table.bindings.get(&value) else {
                CacheStats::bump(&stats.misses);
                lookups.push(Lookup { value, slot: None });
                continue;
            };

            if table.read_lock(value, slot) {
                CacheStats::bump(&stats.hits);
                self.resolved.insert(value);
                lookups.push(Lookup {
                    value,
                    slot: Some(slot),
                });
            } else {
                CacheStats::bump(&stats.misses);
                lookups.push(Lookup { value, slot: None });
            }
        }

        Ok(lookups)
    }

    /// Resolve every block in `values` to a slot.
    ///
    /// Blocks already locked by this bracket are skipped. For the rest, in
    /// order of preference:
    /// 1. WriteLocked elsewhere: wait for the upload, then share it
    /// 2. Cached: read-lock it
    /// 3. take a Free slot and WriteLock it
    /// 4. evict the lowest-priority Cached slot and WriteLock it
    /// 5. wait for a release to make a slot reclaimable
    ///
    /// If the bracket itself holds every slot no release can help; the batch
    /// is rolled back and `CapacityExceeded` returned.
    pub fn reserve_for_write(
        &mut self,
        values: &[BlockIndex],
    ) -> Result<Vec<Reservation>, CacheError> {
        let cache = self.cache;
        let mut table = cache.table.lock();
        let mut reserved: Vec<Reservation> = Vec::with_capacity(values.len());

        for &value in values {
            if let Err(e) = check_valid(value) {
                self.rollback(&mut table, reserved);
                return Err(e);
            }
            if self.resolved.contains(&value) {
                continue;
            }

            let reservation = loop {
                if let Some(&slot) = table.bindings.get(&value) {
                    if table.read_lock(value, slot) {
                        break Reservation::Resident { value, slot };
                    }
                    CacheStats::bump(&cache.stats.waits);
                    debug!(block = %value, %slot, "Waiting for concurrent upload");
                    cache.uploaded.wait(&mut table);
                    continue;
                }

                if let Some(slot) = table.free.pop_front() {
                    trace!(block = %value, %slot, "Reserved free slot");
                    break Reservation::Upload(table.bind(value, slot));
                }

                if !table.policy.is_empty() {
                    match table.evict_into(value) {
                        Ok(ticket) => {
                            CacheStats::bump(&cache.stats.evictions);
                            break Reservation::Upload(ticket);
                        }
                        Err(e) => {
                            self.rollback(&mut table, reserved);
                            return Err(e);
                        }
                    }
                }

                let held = self.resolved.len();
                if held >= table.slots.len() {
                    let capacity = table.slots.len();
                    error!(block = %value, capacity, "Batch exceeds cache capacity");
                    self.rollback(&mut table, reserved);
                    return Err(CacheError::CapacityExceeded { capacity });
                }

                CacheStats::bump(&cache.stats.waits);
                debug!(block = %value, "No reclaimable slot, waiting for release");
                cache.reclaimable.wait(&mut table);
            };

            self.resolved.insert(value);
            reserved.push(reservation);
        }

        Ok(reserved)
    }

    /// End the critical section.
    pub fn release(self) {}

    /// Undo a partially reserved batch.
    fn rollback(&mut self, table: &mut MutexGuard<'_, ResidencyTable>, reserved: Vec<Reservation>) {
        let mut reclaimed = false;
        for reservation in reserved {
            self.resolved.remove(&reservation.value());
            let outcome = match reservation {
                Reservation::Upload(ticket) => {
                    reclaimed = true;
                    table.abandon(ticket.value(), ticket.slot())
                }
                Reservation::Resident { value, .. } => table.release(value).map(|c| {
                    reclaimed |= c;
                }),
            };
            if let Err(e) = outcome {
                error!(error = %e, "Rollback failed");
            }
        }
        if reclaimed {
            self.cache.reclaimable.notify_all();
        }
    }
}

impl Drop for CacheBracket<'_> {
    fn drop(&mut self) {
        *self.cache.bracket_owner.lock() = None;
    }
}

fn check_valid(value: BlockIndex) -> Result<(), CacheError> {
    if value.is_valid() {
        Ok(())
    } else {
        error!(block = %value, "Invalid block index");
        Err(CacheError::InvalidBlockIndex(value))
    }
}
