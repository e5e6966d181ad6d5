//! Volume datasets.
//!
//! - [`block`]: BlockIndex, VoxelType, VolumeMetadata
//! - [`provider`]: The block provider contract
//! - [`synthetic`]: Procedural provider for testing and demos
//! - [`raw`]: Provider over a raw voxel file

pub mod block;
pub mod provider;
pub mod raw;
pub mod synthetic;
