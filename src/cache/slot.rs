//! Residency slots and their states.
//!
//! A slot is one of a fixed pool of GPU-resident block containers. Slots are
//! registered once and then only rebound between block indices.

use serde::{Deserialize, Serialize};

use crate::volume::block::BlockIndex;

/// Handle to one physical residency slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntrySlot(u32);

impl EntrySlot {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for EntrySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Lifecycle state of a slot. Exactly one holds at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Unbound, available for reservation.
    Free,
    /// Bound and uploaded, no readers; eligible for eviction.
    Cached(BlockIndex),
    /// Bound and uploaded, in use by `readers` frames.
    ReadLocked { value: BlockIndex, readers: u32 },
    /// Bound, upload in progress by the single ticket holder.
    WriteLocked(BlockIndex),
}

impl SlotState {
    /// The bound block, if any.
    pub fn value(&self) -> Option<BlockIndex> {
        match self {
            SlotState::Free => None,
            SlotState::Cached(v) | SlotState::WriteLocked(v) => Some(*v),
            SlotState::ReadLocked { value, .. } => Some(*value),
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, SlotState::ReadLocked { .. } | SlotState::WriteLocked(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            SlotState::Free => "free",
            SlotState::Cached(_) => "cached",
            SlotState::ReadLocked { .. } => "read_locked",
            SlotState::WriteLocked(_) => "write_locked",
        }
    }
}

/// Exclusive right to fill a WriteLocked slot.
///
/// Only the cache creates tickets, and only [`ResidencyCache::mark_uploaded`]
/// or [`ResidencyCache::abandon`] consume them, so each WriteLocked slot has
/// exactly one writer.
///
/// [`ResidencyCache::mark_uploaded`]: crate::cache::residency::ResidencyCache::mark_uploaded
/// [`ResidencyCache::abandon`]: crate::cache::residency::ResidencyCache::abandon
#[derive(Debug)]
#[must_use = "a dropped ticket leaves its slot WriteLocked forever"]
pub struct WriteTicket {
    value: BlockIndex,
    slot: EntrySlot,
}

impl WriteTicket {
    pub(crate) fn new(value: BlockIndex, slot: EntrySlot) -> Self {
        Self { value, slot }
    }

    pub fn value(&self) -> BlockIndex {
        self.value
    }

    pub fn slot(&self) -> EntrySlot {
        self.slot
    }
}

/// Outcome of `reserve_for_write` for one block.
#[derive(Debug)]
pub enum Reservation {
    /// Already uploaded; the caller holds one reader reference.
    Resident { value: BlockIndex, slot: EntrySlot },
    /// The caller must fill the slot and hand the ticket back.
    Upload(WriteTicket),
}

impl Reservation {
    pub fn value(&self) -> BlockIndex {
        match self {
            Reservation::Resident { value, .. } => *value,
            Reservation::Upload(ticket) => ticket.value(),
        }
    }

    pub fn slot(&self) -> EntrySlot {
        match self {
            Reservation::Resident { slot, .. } => *slot,
            Reservation::Upload(ticket) => ticket.slot(),
        }
    }

    pub fn needs_upload(&self) -> bool {
        matches!(self, Reservation::Upload(_))
    }
}

/// Outcome of `query_and_read_lock` for one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookup {
    pub value: BlockIndex,
    /// Set on a hit; the caller then holds one reader reference.
    pub slot: Option<EntrySlot>,
}

impl Lookup {
    pub fn hit(&self) -> bool {
        self.slot.is_some()
    }
}
