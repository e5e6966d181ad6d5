//! Spatial index.
//!
//! - [`geometry`]: Boxes, planes, frusta and visibility classification
//! - [`octree`]: LOD octree resolving a view into block indices

pub mod geometry;
pub mod octree;
