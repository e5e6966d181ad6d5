//! Runtime configuration for volstream.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! All cache, streaming and level-of-detail knobs live here.

use std::path::PathBuf;

use clap::Parser;
use glam::{UVec3, Vec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::volume::block::{VolumeMetadata, VoxelType};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "volstream", about = "Out-of-core volume streaming demo")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Raw dataset header; overrides the configured dataset.
    #[arg(short, long)]
    pub dataset: Option<PathBuf>,

    /// Number of frames to render.
    #[arg(short, long, default_value_t = 32)]
    pub frames: u64,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub streaming: StreamingConfig,
    pub lod: LodConfig,
    pub dataset: DatasetConfig,
    pub camera: CameraConfig,
}

/// Residency cache sizing and eviction policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of GPU slots. When zero, derived from `gpu_budget_bytes`.
    pub slot_count: u32,

    /// VRAM budget for the block atlas in bytes.
    pub gpu_budget_bytes: usize,

    /// Number of priority buckets (LODs at or above the last share a bucket).
    pub priority_buckets: usize,

    /// Admission FIFO capacity per bucket.
    pub admission_capacity: usize,

    /// Recency tier capacity per bucket.
    pub recency_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            slot_count: 0,
            gpu_budget_bytes: 512 * 1024 * 1024,
            priority_buckets: 4,
            admission_capacity: 64,
            recency_capacity: 128,
        }
    }
}

/// Decode worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Number of concurrent decode workers (and decode buffers).
    pub workers: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

/// Level-of-detail selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LodConfig {
    /// `distances[i]`: blocks closer than this use level `i`. Increasing.
    pub distances: Vec<f32>,

    /// Render every block at this level instead of selecting by distance.
    pub fixed_level: Option<u32>,
}

impl Default for LodConfig {
    fn default() -> Self {
        Self {
            distances: vec![256.0, 512.0, 1024.0],
            fixed_level: None,
        }
    }
}

/// Dataset selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Raw dataset header. When absent a synthetic volume is generated.
    pub path: Option<PathBuf>,

    pub dimensions: [u32; 3],
    pub spacing: [f32; 3],
    pub block_length: u32,
    pub block_padding: u32,
    pub voxel_type: VoxelType,
    pub max_lod: u32,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            path: None,
            dimensions: [512, 512, 512],
            spacing: [1.0, 1.0, 1.0],
            block_length: 64,
            block_padding: 1,
            voxel_type: VoxelType::U8,
            max_lod: 3,
        }
    }
}

impl DatasetConfig {
    /// Metadata for the synthetic volume.
    pub fn synthetic_metadata(&self) -> VolumeMetadata {
        VolumeMetadata {
            dimensions: UVec3::from_array(self.dimensions),
            spacing: Vec3::from_array(self.spacing),
            block_length: self.block_length,
            block_padding: self.block_padding,
            voxel_type: self.voxel_type,
            max_lod: self.max_lod,
        }
    }
}

/// Orbit camera used by the demo binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Orbit radius as a multiple of the volume's half diagonal.
    pub orbit_scale: f32,

    /// Orbit step per frame in radians.
    pub step_radians: f32,

    pub fov_degrees: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            orbit_scale: 1.5,
            step_radians: 0.05,
            fov_degrees: 60.0,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.streaming.workers == 0 {
            return Err(ConfigError::Invalid("streaming.workers must be > 0".into()));
        }
        if self.cache.priority_buckets == 0 {
            return Err(ConfigError::Invalid("cache.priority_buckets must be > 0".into()));
        }
        if self.cache.slot_count == 0 && self.cache.gpu_budget_bytes == 0 {
            return Err(ConfigError::Invalid(
                "cache.slot_count or cache.gpu_budget_bytes must be set".into(),
            ));
        }
        if self.lod.distances.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::Invalid(
                "lod.distances must be strictly increasing".into(),
            ));
        }
        Ok(())
    }

    /// Number of cache slots for blocks of `block_bytes` bytes.
    pub fn slot_count(&self, block_bytes: usize) -> u32 {
        if self.cache.slot_count > 0 {
            return self.cache.slot_count;
        }
        if block_bytes == 0 {
            return 0;
        }
        (self.cache.gpu_budget_bytes / block_bytes).min(u32::MAX as usize) as u32
    }
}
