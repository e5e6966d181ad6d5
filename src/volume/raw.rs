//! Raw volume provider.
//!
//! A dataset is a JSON header next to an uncompressed voxel file:
//!
//! ```text
//! { "metadata": { ... }, "data_file": "head.raw" }
//! ```
//!
//! Voxels are stored x-fastest, little endian. Blocks are read with one
//! positioned read per source row, so the file is never loaded whole and
//! decode workers share the file handle without a lock.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::volume::block::{BlockIndex, VolumeMetadata};
use crate::volume::provider::{check_decode_target, source_coord, BlockProvider, ProviderError};

/// On-disk header describing a raw dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawHeader {
    pub metadata: VolumeMetadata,

    /// Voxel file, relative to the header's directory.
    pub data_file: PathBuf,
}

struct OpenDataset {
    metadata: VolumeMetadata,
    file: File,
}

#[derive(Default)]
pub struct RawVolumeProvider {
    dataset: Option<OpenDataset>,
}

impl RawVolumeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn dataset(&self) -> Result<&OpenDataset, ProviderError> {
        self.dataset.as_ref().ok_or(ProviderError::NotOpen)
    }
}

impl BlockProvider for RawVolumeProvider {
    fn open(&mut self, path: &Path) -> Result<(), ProviderError> {
        if !path.exists() {
            return Err(ProviderError::NotFound(path.to_path_buf()));
        }
        let header: RawHeader = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        let data_path = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&header.data_file);
        if !data_path.exists() {
            return Err(ProviderError::NotFound(data_path));
        }

        let meta = header.metadata;
        let expected = meta.dimensions.x as u64
            * meta.dimensions.y as u64
            * meta.dimensions.z as u64
            * meta.voxel_type.bytes_per_voxel() as u64;
        let file = File::open(&data_path)?;
        let actual = file.metadata()?.len();
        if actual < expected {
            return Err(ProviderError::SizeMismatch { expected, actual });
        }

        info!(
            path = %data_path.display(),
            dims = ?meta.dimensions,
            voxel_type = %meta.voxel_type,
            "Opened raw dataset"
        );

        self.dataset = Some(OpenDataset {
            metadata: meta,
            file,
        });
        Ok(())
    }

    fn volume_metadata(&self) -> Result<VolumeMetadata, ProviderError> {
        Ok(self.dataset()?.metadata)
    }

    fn decode_block(&self, dst: &mut [u8], index: BlockIndex) -> Result<(), ProviderError> {
        let dataset = self.dataset()?;
        let meta = &dataset.metadata;
        check_decode_target(meta, dst, &index)?;

        let bpv = meta.voxel_type.bytes_per_voxel();
        let edge = meta.padded_block_length();
        let lod = index.lod as u32;
        let block = index.grid_position();
        let dims = meta.dimensions;

        let xs: Vec<u32> = (0..edge)
            .map(|i| source_coord(block.x, i, meta, lod, dims.x))
            .collect();
        let (x_min, x_max) = (xs[0], xs[xs.len() - 1]);
        let mut row = vec![0u8; (x_max - x_min + 1) as usize * bpv];

        let mut out = 0usize;
        for k in 0..edge {
            let z = source_coord(block.z, k, meta, lod, dims.z) as u64;
            for j in 0..edge {
                let y = source_coord(block.y, j, meta, lod, dims.y) as u64;
                let voxel = (z * dims.y as u64 + y) * dims.x as u64 + x_min as u64;
                dataset.file.read_exact_at(&mut row, voxel * bpv as u64)?;

                for &x in &xs {
                    let src = (x - x_min) as usize * bpv;
                    dst[out..out + bpv].copy_from_slice(&row[src..src + bpv]);
                    out += bpv;
                }
            }
        }

        debug!(block = %index, bytes = out, "Decoded raw block");
        Ok(())
    }
}
