//! GPU residency cache.
//!
//! This module contains the page table that maps blocks onto a fixed pool
//! of GPU slots:
//! - [`slot`]: EntrySlot, SlotState, WriteTicket, Reservation
//! - [`multi_queue`]: Priority-bucketed FIFO+LRU eviction policy
//! - [`residency`]: The residency cache and its acquire/release bracket

pub mod multi_queue;
pub mod residency;
pub mod slot;
