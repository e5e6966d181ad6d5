//! Block upload into the GPU slot atlas.
//!
//! The real implementation copies a decoded block into one sub-region of a 3D
//! atlas texture. [`HostAtlas`] stands in for it: it keeps the atlas in host
//! memory, which is enough for tests and for running without a GPU.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use crate::cache::slot::EntrySlot;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("{slot} is outside the atlas ({capacity} slots)")]
    SlotOutOfRange { slot: EntrySlot, capacity: u32 },

    #[error("Block too large for slot: need {needed} bytes, slot holds {available}")]
    BlockTooLarge { needed: usize, available: usize },

    #[error("Device error: {0}")]
    Device(String),
}

/// GPU upload collaborator. Only ever handed WriteLocked slots.
pub trait BlockUploader: Send + Sync {
    /// Copy `data` into `slot`.
    fn upload(&self, slot: EntrySlot, data: &[u8]) -> Result<(), UploadError>;

    /// Wait until every upload issued under `tag` is visible to the GPU.
    fn flush(&self, tag: u64) -> Result<(), UploadError>;
}

#[derive(Debug, Default)]
pub struct UploadStats {
    pub uploads: AtomicU64,
    pub bytes: AtomicU64,
    pub flushes: AtomicU64,
}

/// Host-memory block atlas.
pub struct HostAtlas {
    slot_bytes: usize,
    capacity: u32,
    memory: Mutex<Vec<u8>>,
    stats: UploadStats,
}

impl HostAtlas {
    pub fn new(capacity: u32, slot_bytes: usize) -> Self {
        Self {
            slot_bytes,
            capacity,
            memory: Mutex::new(vec![0u8; capacity as usize * slot_bytes]),
            stats: UploadStats::default(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    /// Copy of the bytes currently held by `slot`.
    pub fn read_slot(&self, slot: EntrySlot) -> Option<Vec<u8>> {
        if slot.id() >= self.capacity {
            return None;
        }
        let start = slot.id() as usize * self.slot_bytes;
        Some(self.memory.lock()[start..start + self.slot_bytes].to_vec())
    }

    pub fn stats(&self) -> &UploadStats {
        &self.stats
    }
}

impl BlockUploader for HostAtlas {
    fn upload(&self, slot: EntrySlot, data: &[u8]) -> Result<(), UploadError> {
        if slot.id() >= self.capacity {
            return Err(UploadError::SlotOutOfRange {
                slot,
                capacity: self.capacity,
            });
        }
        if data.len() > self.slot_bytes {
            return Err(UploadError::BlockTooLarge {
                needed: data.len(),
                available: self.slot_bytes,
            });
        }

        let start = slot.id() as usize * self.slot_bytes;
        self.memory.lock()[start..start + data.len()].copy_from_slice(data);

        trace!(%slot, size = data.len(), "Block upload");
        self.stats.uploads.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self, tag: u64) -> Result<(), UploadError> {
        debug!(tag, "Upload flush");
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_and_read_back() {
        let atlas = HostAtlas::new(4, 16);
        atlas.upload(EntrySlot::new(2), &[7u8; 16]).unwrap();

        assert_eq!(atlas.read_slot(EntrySlot::new(2)).unwrap(), vec![7u8; 16]);
        assert_eq!(atlas.read_slot(EntrySlot::new(1)).unwrap(), vec![0u8; 16]);
        assert_eq!(atlas.stats().uploads.load(Ordering::Relaxed), 1);
        assert_eq!(atlas.stats().bytes.load(Ordering::Relaxed), 16);
    }

    #[test]
    fn test_invalid_slot() {
        let atlas = HostAtlas::new(1, 16);
        let result = atlas.upload(EntrySlot::new(5), &[0u8; 4]);
        assert!(matches!(result, Err(UploadError::SlotOutOfRange { .. })));
        assert!(atlas.read_slot(EntrySlot::new(5)).is_none());
    }

    #[test]
    fn test_block_too_large() {
        let atlas = HostAtlas::new(1, 8);
        let result = atlas.upload(EntrySlot::new(0), &[0u8; 9]);
        assert!(matches!(result, Err(UploadError::BlockTooLarge { .. })));
    }
}
