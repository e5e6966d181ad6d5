//! Block identity and volume metadata.
//!
//! A volume is cut into cubes of `block_length` voxels per axis. Every block
//! exists at every level of detail: at LOD `l` one block covers
//! `block_length * 2^l` source voxels per axis, resampled to `block_length`.

use glam::{UVec3, Vec3};
use serde::{Deserialize, Serialize};

/// Identifies one block of the volume at one level of detail.
///
/// A component that is negative marks the index as unset. Equality and
/// hashing are structural, so the index doubles as the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockIndex {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    /// Level of detail (0 = finest).
    pub lod: i32,
}

impl BlockIndex {
    /// The unset index.
    pub const INVALID: BlockIndex = BlockIndex {
        x: -1,
        y: -1,
        z: -1,
        lod: -1,
    };

    pub const fn new(x: i32, y: i32, z: i32, lod: i32) -> Self {
        Self { x, y, z, lod }
    }

    /// Whether every component is set.
    pub fn is_valid(&self) -> bool {
        self.x >= 0 && self.y >= 0 && self.z >= 0 && self.lod >= 0
    }

    /// Grid coordinates of this block within its level.
    pub fn grid_position(&self) -> UVec3 {
        UVec3::new(self.x.max(0) as u32, self.y.max(0) as u32, self.z.max(0) as u32)
    }

    /// The index one level coarser that covers this block.
    pub fn parent(&self) -> BlockIndex {
        BlockIndex::new(self.x / 2, self.y / 2, self.z / 2, self.lod + 1)
    }
}

impl Default for BlockIndex {
    fn default() -> Self {
        Self::INVALID
    }
}

impl std::fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})@lod{}", self.x, self.y, self.z, self.lod)
    }
}

/// Storage type of a single voxel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoxelType {
    U8,
    U16,
    F16,
    F32,
}

impl VoxelType {
    pub fn bytes_per_voxel(&self) -> usize {
        match self {
            VoxelType::U8 => 1,
            VoxelType::U16 | VoxelType::F16 => 2,
            VoxelType::F32 => 4,
        }
    }
}

impl std::fmt::Display for VoxelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoxelType::U8 => write!(f, "u8"),
            VoxelType::U16 => write!(f, "u16"),
            VoxelType::F16 => write!(f, "f16"),
            VoxelType::F32 => write!(f, "f32"),
        }
    }
}

/// Read-only description of an opened dataset.
///
/// Copied by value into the index and the cache configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeMetadata {
    /// Voxel dimensions of the full-resolution volume.
    pub dimensions: UVec3,

    /// Physical size of one voxel along each axis.
    pub spacing: Vec3,

    /// Unpadded block edge length in voxels.
    pub block_length: u32,

    /// Voxels of overlap stored on each side of a block.
    pub block_padding: u32,

    pub voxel_type: VoxelType,

    /// Coarsest level of detail the dataset provides.
    pub max_lod: u32,
}

impl Default for VolumeMetadata {
    fn default() -> Self {
        Self {
            dimensions: UVec3::splat(512),
            spacing: Vec3::ONE,
            block_length: 128,
            block_padding: 1,
            voxel_type: VoxelType::U8,
            max_lod: 2,
        }
    }
}

impl VolumeMetadata {
    /// Edge length of a stored block including padding on both sides.
    pub fn padded_block_length(&self) -> u32 {
        self.block_length + 2 * self.block_padding
    }

    /// Size in bytes of one decoded, padded block.
    pub fn block_bytes(&self) -> usize {
        let edge = self.padded_block_length() as usize;
        edge * edge * edge * self.voxel_type.bytes_per_voxel()
    }

    /// Number of blocks along each axis at the given level.
    pub fn block_grid(&self, lod: u32) -> UVec3 {
        let span = self.block_length.max(1) << lod;
        (self.dimensions + UVec3::splat(span - 1)) / UVec3::splat(span)
    }

    /// Whether `index` names a block that exists in this volume.
    pub fn contains(&self, index: &BlockIndex) -> bool {
        if !index.is_valid() || index.lod as u32 > self.max_lod {
            return false;
        }
        let grid = self.block_grid(index.lod as u32);
        index.grid_position().cmplt(grid).all()
    }

    /// Physical extent of the volume.
    pub fn extent(&self) -> Vec3 {
        self.dimensions.as_vec3() * self.spacing
    }
}
