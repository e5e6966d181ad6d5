//! Block data providers.
//!
//! A provider materializes the voxels of one block into a caller-owned buffer.
//! Decoding is treated as an opaque, potentially slow, blocking call; the
//! streaming coordinator runs it on blocking worker threads.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::volume::block::{BlockIndex, VolumeMetadata};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid dataset header: {0}")]
    InvalidHeader(#[from] serde_json::Error),

    #[error("Dataset not opened")]
    NotOpen,

    #[error("Dataset file not found: {0}")]
    NotFound(PathBuf),

    #[error("Block {0} is outside the volume")]
    BlockOutOfRange(BlockIndex),

    #[error("Decode buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("Raw data holds {actual} bytes, header describes {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
}

/// Source of decoded block voxels.
pub trait BlockProvider: Send + Sync {
    /// Open the dataset at `path`. Must be called before the provider is shared.
    fn open(&mut self, path: &Path) -> Result<(), ProviderError>;

    /// Metadata of the opened dataset.
    fn volume_metadata(&self) -> Result<VolumeMetadata, ProviderError>;

    /// Decode the padded block `index` into `dst`.
    ///
    /// `dst` must hold at least [`VolumeMetadata::block_bytes`] bytes.
    fn decode_block(&self, dst: &mut [u8], index: BlockIndex) -> Result<(), ProviderError>;
}

/// Shared pre-flight checks for `decode_block` implementations.
pub(crate) fn check_decode_target(
    meta: &VolumeMetadata,
    dst: &[u8],
    index: &BlockIndex,
) -> Result<usize, ProviderError> {
    if !meta.contains(index) {
        return Err(ProviderError::BlockOutOfRange(*index));
    }
    let needed = meta.block_bytes();
    if dst.len() < needed {
        return Err(ProviderError::BufferTooSmall {
            needed,
            available: dst.len(),
        });
    }
    Ok(needed)
}

/// Source voxel coordinate for padded block voxel `local` along one axis.
///
/// Coordinates outside the volume clamp to the nearest edge voxel.
pub(crate) fn source_coord(block: u32, local: u32, meta: &VolumeMetadata, lod: u32, dim: u32) -> u32 {
    let start = (block * meta.block_length) as i64 - meta.block_padding as i64;
    let scaled = (start + local as i64) << lod;
    scaled.clamp(0, dim.saturating_sub(1) as i64) as u32
}
