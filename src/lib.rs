//! volstream: out-of-core volume streaming.
//!
//! Renders volumes larger than VRAM by keeping only the blocks a view needs
//! resident in a fixed set of GPU slots:
//!   LOD octree (what is visible) → residency cache (what is resident)
//!   → streaming coordinator (decode + upload the rest)
//!
//! [`orchestrator::FrameOrchestrator`] wires the pieces into a per-frame pass.

pub mod cache;
pub mod config;
pub mod gpu;
pub mod index;
pub mod orchestrator;
pub mod streaming;
pub mod telemetry;
pub mod volume;
