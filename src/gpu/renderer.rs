//! Renderer collaborator.
//!
//! After a frame's blocks are resident the renderer receives the
//! `(slot, block)` pairs and builds its own lookup structure for shading.

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::slot::EntrySlot;
use crate::volume::block::BlockIndex;

pub trait ResidencyConsumer: Send + Sync {
    fn update_residency(&self, frame: u64, entries: &[(EntrySlot, BlockIndex)]);
}

/// Keeps the most recent frame's entries; used headless and in tests.
#[derive(Default)]
pub struct RecordingRenderer {
    last: Mutex<(u64, Vec<(EntrySlot, BlockIndex)>)>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame number and entries of the last update.
    pub fn last_frame(&self) -> (u64, Vec<(EntrySlot, BlockIndex)>) {
        self.last.lock().clone()
    }
}

impl ResidencyConsumer for RecordingRenderer {
    fn update_residency(&self, frame: u64, entries: &[(EntrySlot, BlockIndex)]) {
        debug!(frame, blocks = entries.len(), "Residency update");
        *self.last.lock() = (frame, entries.to_vec());
    }
}
