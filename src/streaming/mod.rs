//! Block streaming.
//!
//! - [`buffer_pool`]: Decode-target buffers, one per worker
//! - [`coordinator`]: Worker pool turning write reservations into uploads

pub mod buffer_pool;
pub mod coordinator;
