//! volstream demo: orbits a camera around a volume and streams the blocks
//! each frame needs through the residency cache.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use glam::{Mat4, Vec3};
use tracing::{info, warn};

use volstream::cache::residency::ResidencyCache;
use volstream::config::{Cli, Config};
use volstream::gpu::renderer::RecordingRenderer;
use volstream::gpu::upload::HostAtlas;
use volstream::index::geometry::{Frustum, ViewRegion};
use volstream::index::octree::LodOctree;
use volstream::orchestrator::{FrameOrchestrator, FrameView};
use volstream::streaming::coordinator::StreamingCoordinator;
use volstream::telemetry::Metrics;
use volstream::volume::provider::BlockProvider;
use volstream::volume::raw::RawVolumeProvider;
use volstream::volume::synthetic::SyntheticProvider;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "volstream=debug"
    } else {
        "volstream=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("volstream v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&cli.config)?;

    // Dataset: --dataset wins over the config file, otherwise synthetic.
    let dataset = cli.dataset.clone().or_else(|| config.dataset.path.clone());
    let provider: Arc<dyn BlockProvider> = match dataset {
        Some(path) => {
            let mut raw = RawVolumeProvider::new();
            raw.open(&path)
                .with_context(|| format!("opening dataset {}", path.display()))?;
            Arc::new(raw)
        }
        None => {
            let mut synthetic = SyntheticProvider::new(config.dataset.synthetic_metadata());
            synthetic.open(std::path::Path::new("synthetic"))?;
            Arc::new(synthetic)
        }
    };
    let meta = provider.volume_metadata()?;
    let block_bytes = meta.block_bytes();

    let index = Arc::new(LodOctree::build(&meta));
    if index.levels() - 1 > meta.max_lod {
        anyhow::bail!(
            "dataset stops at lod{} but its block grid needs lod{} for a single root",
            meta.max_lod,
            index.levels() - 1
        );
    }
    let slots = config.slot_count(block_bytes);
    if slots == 0 {
        anyhow::bail!("GPU budget too small for a single {block_bytes}-byte block");
    }

    info!(
        dimensions = ?meta.dimensions,
        voxel = %meta.voxel_type,
        block_length = meta.block_length,
        levels = index.levels(),
        leaves = index.leaf_count(),
        slots,
        block_bytes,
        "Volume loaded"
    );

    let cache = Arc::new(ResidencyCache::with_slots(slots, &config.cache));
    let atlas = Arc::new(HostAtlas::new(slots, block_bytes));
    let renderer = Arc::new(RecordingRenderer::new());
    let metrics = Arc::new(Metrics::new()?);
    let coordinator = StreamingCoordinator::new(
        cache.clone(),
        provider,
        atlas.clone(),
        config.streaming.workers,
        block_bytes,
    );
    let orchestrator = FrameOrchestrator::new(
        index,
        cache,
        coordinator,
        atlas,
        renderer,
        config.lod.clone(),
        block_bytes,
    )
    .with_metrics(metrics.clone());

    let extent = meta.extent();
    let center = extent * 0.5;
    let radius = extent.length() * 0.5 * config.camera.orbit_scale;
    let aspect = 16.0 / 9.0;
    let projection = Mat4::perspective_rh(
        config.camera.fov_degrees.to_radians(),
        aspect,
        0.1,
        radius * 4.0,
    );

    for step in 0..cli.frames {
        let angle = step as f32 * config.camera.step_radians;
        let eye = center + Vec3::new(angle.cos(), 0.35, angle.sin()) * radius;
        let view = Mat4::look_at_rh(eye, center, Vec3::Y);
        let frame_view = FrameView {
            region: ViewRegion::Frustum(Frustum::from_view_projection(&(projection * view))),
            selection: orchestrator.default_selection(eye),
        };

        match orchestrator.render_frame(&frame_view).await {
            Ok(report) => info!(
                frame = report.frame,
                requested = report.requested,
                hits = report.hits,
                uploaded = report.uploaded,
                "Frame rendered"
            ),
            Err(e) => warn!(frame = step, error = %e, "Frame failed"),
        }
    }

    let stats = orchestrator.cache().stats();
    info!(
        hits = stats.hits,
        misses = stats.misses,
        uploads = stats.uploads,
        evictions = stats.evictions,
        "Cache totals"
    );
    println!("{}", metrics.render());

    Ok(())
}
