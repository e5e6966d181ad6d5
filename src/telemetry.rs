//! Prometheus metrics for the streaming pipeline.
//!
//! Counters mirror the cache's own [`CacheStats`](crate::cache::residency::CacheStats)
//! so they can be scraped or dumped in the text exposition format.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::cache::residency::{CacheStatsSnapshot, ResidencyCache};

pub struct Metrics {
    registry: Registry,
    hits: IntCounter,
    misses: IntCounter,
    uploads: IntCounter,
    evictions: IntCounter,
    streamed_bytes: IntCounter,
    stream_failures: IntCounter,
    slots: IntGaugeVec,
    frame_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("volstream".into()), None)?;

        let hits = IntCounter::new("cache_hits_total", "Blocks found resident")?;
        let misses = IntCounter::new("cache_misses_total", "Blocks not resident at query time")?;
        let uploads = IntCounter::new("cache_uploads_total", "Blocks uploaded into a slot")?;
        let evictions = IntCounter::new("cache_evictions_total", "Cached blocks evicted")?;
        let streamed_bytes = IntCounter::new("streamed_bytes_total", "Decoded bytes uploaded")?;
        let stream_failures =
            IntCounter::new("stream_failures_total", "Stream batches that failed")?;
        let slots = IntGaugeVec::new(Opts::new("slots", "Slots per residency state"), &["state"])?;
        let frame_seconds = Histogram::with_opts(
            HistogramOpts::new("frame_seconds", "Wall time per frame").buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
            ]),
        )?;

        registry.register(Box::new(hits.clone()))?;
        registry.register(Box::new(misses.clone()))?;
        registry.register(Box::new(uploads.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(streamed_bytes.clone()))?;
        registry.register(Box::new(stream_failures.clone()))?;
        registry.register(Box::new(slots.clone()))?;
        registry.register(Box::new(frame_seconds.clone()))?;

        Ok(Self {
            registry,
            hits,
            misses,
            uploads,
            evictions,
            streamed_bytes,
            stream_failures,
            slots,
            frame_seconds,
        })
    }

    /// Bring counters and gauges up to date with the cache.
    pub fn observe_cache(&self, cache: &ResidencyCache) {
        let CacheStatsSnapshot {
            hits,
            misses,
            uploads,
            evictions,
            ..
        } = cache.stats();
        advance(&self.hits, hits);
        advance(&self.misses, misses);
        advance(&self.uploads, uploads);
        advance(&self.evictions, evictions);

        let (free, cached, read_locked, write_locked) = cache.state_counts();
        for (state, count) in [
            ("free", free),
            ("cached", cached),
            ("read_locked", read_locked),
            ("write_locked", write_locked),
        ] {
            self.slots.with_label_values(&[state]).set(count as i64);
        }
    }

    pub fn observe_frame(&self, seconds: f64, streamed_bytes: u64) {
        self.frame_seconds.observe(seconds);
        self.streamed_bytes.inc_by(streamed_bytes);
    }

    pub fn observe_stream_failure(&self) {
        self.stream_failures.inc();
    }

    /// Text exposition of every metric.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

/// Move a monotonic counter forward to `total`.
fn advance(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}
