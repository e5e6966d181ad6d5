//! GPU-side collaborators.
//!
//! - [`upload`]: Block upload into the slot atlas
//! - [`renderer`]: Consumer of per-frame residency

pub mod renderer;
pub mod upload;
