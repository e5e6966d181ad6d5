//! Procedural dataset: a set of concentric shells with a soft falloff.
//!
//! Useful for exercising the streaming path without a dataset on disk.
//! Every level of detail is sampled directly from the analytic field.

use std::path::Path;

use glam::{UVec3, Vec3};
use half::f16;
use tracing::debug;

use crate::volume::block::{BlockIndex, VolumeMetadata, VoxelType};
use crate::volume::provider::{check_decode_target, source_coord, BlockProvider, ProviderError};

pub struct SyntheticProvider {
    metadata: VolumeMetadata,
    opened: bool,
}

impl SyntheticProvider {
    pub fn new(metadata: VolumeMetadata) -> Self {
        Self {
            metadata,
            opened: false,
        }
    }

    /// Field value in `[0, 1]` at a voxel coordinate.
    pub fn sample(&self, voxel: UVec3) -> f32 {
        let dims = self.metadata.dimensions.as_vec3().max(Vec3::ONE);
        let p = (voxel.as_vec3() + Vec3::splat(0.5)) / dims * 2.0 - Vec3::ONE;
        let r = p.length();
        let shells = (r * 12.0).sin() * 0.5 + 0.5;
        let falloff = (1.0 - r).clamp(0.0, 1.0);
        shells * falloff
    }

    fn fill<T: bytemuck::Pod>(
        &self,
        dst: &mut [u8],
        index: &BlockIndex,
        convert: impl Fn(f32) -> T,
    ) {
        let meta = &self.metadata;
        let edge = meta.padded_block_length();
        let lod = index.lod as u32;
        let block = index.grid_position();
        let dims = meta.dimensions;

        let mut voxels: Vec<T> = Vec::with_capacity((edge * edge * edge) as usize);
        for k in 0..edge {
            let z = source_coord(block.z, k, meta, lod, dims.z);
            for j in 0..edge {
                let y = source_coord(block.y, j, meta, lod, dims.y);
                for i in 0..edge {
                    let x = source_coord(block.x, i, meta, lod, dims.x);
                    voxels.push(convert(self.sample(UVec3::new(x, y, z))));
                }
            }
        }

        let bytes: &[u8] = bytemuck::cast_slice(&voxels);
        dst[..bytes.len()].copy_from_slice(bytes);
    }
}

impl BlockProvider for SyntheticProvider {
    fn open(&mut self, path: &Path) -> Result<(), ProviderError> {
        debug!(path = %path.display(), "Synthetic dataset ignores path");
        self.opened = true;
        Ok(())
    }

    fn volume_metadata(&self) -> Result<VolumeMetadata, ProviderError> {
        if !self.opened {
            return Err(ProviderError::NotOpen);
        }
        Ok(self.metadata)
    }

    fn decode_block(&self, dst: &mut [u8], index: BlockIndex) -> Result<(), ProviderError> {
        if !self.opened {
            return Err(ProviderError::NotOpen);
        }
        check_decode_target(&self.metadata, dst, &index)?;

        match self.metadata.voxel_type {
            VoxelType::U8 => self.fill(dst, &index, |v| (v * 255.0).round() as u8),
            VoxelType::U16 => self.fill(dst, &index, |v| (v * 65535.0).round() as u16),
            VoxelType::F16 => self.fill(dst, &index, f16::from_f32),
            VoxelType::F32 => self.fill(dst, &index, |v| v),
        }
        Ok(())
    }
}
