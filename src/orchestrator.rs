//! Frame orchestrator: drives one render pass through the streaming core.
//!
//! Per frame:
//! 1. Resolve the view into block indices with the LOD octree
//! 2. Read-lock resident blocks and reserve slots for the rest (bracketed)
//! 3. Stream reserved blocks through the coordinator
//! 4. Flush uploads and publish `(slot, block)` pairs to the renderer
//! 5. Release every reader reference taken for the frame

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::Vec3;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::cache::residency::{CacheError, ResidencyCache};
use crate::cache::slot::{EntrySlot, Reservation, WriteTicket};
use crate::config::LodConfig;
use crate::gpu::renderer::ResidencyConsumer;
use crate::gpu::upload::{BlockUploader, UploadError};
use crate::index::geometry::ViewRegion;
use crate::index::octree::LodOctree;
use crate::streaming::coordinator::{StreamError, StreamingCoordinator};
use crate::telemetry::Metrics;
use crate::volume::block::BlockIndex;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Streaming failed: {0}")]
    Stream(#[from] StreamError),

    #[error("Upload flush failed: {0}")]
    Flush(#[from] UploadError),

    #[error("Reservation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// How block levels are chosen for a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LodSelection {
    /// Every block at one level.
    Fixed(u32),
    /// Level by distance from the eye, per the configured table.
    Distance { eye: Vec3 },
}

/// One frame's view.
#[derive(Debug, Clone, Copy)]
pub struct FrameView {
    pub region: ViewRegion,
    pub selection: LodSelection,
}

/// Summary of a completed frame.
#[derive(Debug, Clone, Default)]
pub struct FrameReport {
    pub frame: u64,
    /// Blocks the view needed.
    pub requested: usize,
    /// Resident at query time.
    pub hits: usize,
    /// Uploaded by another frame while this one waited, or cached meanwhile.
    pub shared: usize,
    /// Decoded and uploaded by this frame.
    pub uploaded: usize,
    pub elapsed: Duration,
}

pub struct FrameOrchestrator {
    index: Arc<LodOctree>,
    cache: Arc<ResidencyCache>,
    coordinator: StreamingCoordinator,
    uploader: Arc<dyn BlockUploader>,
    renderer: Arc<dyn ResidencyConsumer>,
    lod: LodConfig,
    metrics: Option<Arc<Metrics>>,
    block_bytes: usize,
    next_frame: AtomicU64,
}

impl FrameOrchestrator {
    pub fn new(
        index: Arc<LodOctree>,
        cache: Arc<ResidencyCache>,
        coordinator: StreamingCoordinator,
        uploader: Arc<dyn BlockUploader>,
        renderer: Arc<dyn ResidencyConsumer>,
        lod: LodConfig,
        block_bytes: usize,
    ) -> Self {
        Self {
            index,
            cache,
            coordinator,
            uploader,
            renderer,
            lod,
            metrics: None,
            block_bytes,
            next_frame: AtomicU64::new(0),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cache(&self) -> &Arc<ResidencyCache> {
        &self.cache
    }

    /// Selection from the configuration: a fixed level if one is set,
    /// otherwise distance-driven from `eye`.
    pub fn default_selection(&self, eye: Vec3) -> LodSelection {
        match self.lod.fixed_level {
            Some(level) => LodSelection::Fixed(level),
            None => LodSelection::Distance { eye },
        }
    }

    /// Blocks the view needs.
    pub fn visible_blocks(&self, view: &FrameView) -> Vec<BlockIndex> {
        match view.selection {
            LodSelection::Fixed(level) => self.index.query_level(&view.region, level),
            LodSelection::Distance { eye } => {
                self.index
                    .query_lod(&view.region, eye, &self.lod.distances)
            }
        }
    }

    /// Run one frame end to end.
    pub async fn render_frame(&self, view: &FrameView) -> Result<FrameReport, FrameError> {
        let start = Instant::now();
        let frame = self.next_frame.fetch_add(1, Ordering::Relaxed);
        let values = self.visible_blocks(view);
        let requested = values.len();

        let cache = self.cache.clone();
        let (hits, reservations) =
            tokio::task::spawn_blocking(move || reserve_frame(&cache, &values)).await??;

        let mut resident: Vec<(EntrySlot, BlockIndex)> = hits.clone();
        let mut tickets: Vec<WriteTicket> = Vec::new();
        for reservation in reservations {
            match reservation {
                Reservation::Resident { value, slot } => resident.push((slot, value)),
                Reservation::Upload(ticket) => tickets.push(ticket),
            }
        }
        let shared = resident.len() - hits.len();

        let uploaded = match self.coordinator.stream(tickets).await {
            Ok(uploaded) => uploaded,
            Err(e) => {
                error!(frame, error = %e, "Frame streaming failed");
                if let Some(metrics) = &self.metrics {
                    metrics.observe_stream_failure();
                }
                self.release_all(&resident);
                return Err(e.into());
            }
        };
        resident.extend_from_slice(&uploaded);

        let flushed = self.uploader.flush(frame);
        if flushed.is_ok() {
            self.renderer.update_residency(frame, &resident);
        }
        self.release_all(&resident);
        flushed?;

        let report = FrameReport {
            frame,
            requested,
            hits: hits.len(),
            shared,
            uploaded: uploaded.len(),
            elapsed: start.elapsed(),
        };

        if let Some(metrics) = &self.metrics {
            metrics.observe_frame(
                report.elapsed.as_secs_f64(),
                (report.uploaded * self.block_bytes) as u64,
            );
            metrics.observe_cache(&self.cache);
        }

        info!(
            frame,
            requested,
            hits = report.hits,
            shared,
            uploaded = report.uploaded,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Frame complete"
        );
        Ok(report)
    }

    fn release_all(&self, entries: &[(EntrySlot, BlockIndex)]) {
        for (_, value) in entries {
            if let Err(e) = self.cache.release(*value) {
                error!(block = %value, error = %e, "Frame release failed");
            }
        }
    }
}

/// The bracketed query+reserve phase of a frame.
///
/// Returns the read-locked hits and the reservations for the misses.
fn reserve_frame(
    cache: &ResidencyCache,
    values: &[BlockIndex],
) -> Result<(Vec<(EntrySlot, BlockIndex)>, Vec<Reservation>), CacheError> {
    let mut bracket = cache.acquire()?;
    let lookups = bracket.query_and_read_lock(values)?;

    let mut hits = Vec::with_capacity(lookups.len());
    let mut misses = Vec::new();
    for lookup in lookups {
        match lookup.slot {
            Some(slot) => hits.push((slot, lookup.value)),
            None => misses.push(lookup.value),
        }
    }

    let reservations = match bracket.reserve_for_write(&misses) {
        Ok(reservations) => reservations,
        Err(e) => {
            for (_, value) in &hits {
                if let Err(release_err) = cache.release(*value) {
                    error!(block = %value, error = %release_err, "Release after failed reserve");
                }
            }
            return Err(e);
        }
    };
    bracket.release();

    debug!(
        hits = hits.len(),
        misses = misses.len(),
        "Reserved frame blocks"
    );
    Ok((hits, reservations))
}
