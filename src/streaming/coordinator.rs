//! Streaming coordinator: turns write reservations into uploaded blocks.
//!
//! For each ticket a worker takes a decode buffer from the pool, asks the
//! provider to decode the block, hands the bytes to the uploader and marks
//! the slot uploaded. Workers pull tickets from a shared work list. The first
//! failure (a decode or upload error, or a panic inside either) stops the
//! batch once in-flight items finish; every ticket not uploaded is then
//! abandoned, every uploaded one released, and the error returned.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::residency::{CacheError, ResidencyCache};
use crate::cache::slot::{EntrySlot, WriteTicket};
use crate::gpu::upload::{BlockUploader, UploadError};
use crate::streaming::buffer_pool::BufferPool;
use crate::volume::block::BlockIndex;
use crate::volume::provider::{BlockProvider, ProviderError};

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Decoding block {index} failed: {source}")]
    Decode {
        index: BlockIndex,
        #[source]
        source: ProviderError,
    },

    #[error("Uploading block {index} failed: {source}")]
    Upload {
        index: BlockIndex,
        #[source]
        source: UploadError,
    },

    #[error("Cache protocol error: {0}")]
    Cache(#[from] CacheError),

    #[error("Decode worker panicked: {0}")]
    WorkerPanicked(String),
}

#[derive(Debug, Default)]
pub struct StreamStats {
    pub blocks: AtomicU64,
    pub bytes: AtomicU64,
    pub failures: AtomicU64,
}

/// State shared by the workers of one batch.
struct Batch {
    work: Mutex<VecDeque<WriteTicket>>,
    done: Mutex<Vec<(EntrySlot, BlockIndex)>>,
    failure: Mutex<Option<StreamError>>,
    abort: AtomicBool,
}

pub struct StreamingCoordinator {
    cache: Arc<ResidencyCache>,
    provider: Arc<dyn BlockProvider>,
    uploader: Arc<dyn BlockUploader>,
    pool: Arc<BufferPool>,
    workers: usize,
    stats: Arc<StreamStats>,
}

impl StreamingCoordinator {
    /// `workers` decode tasks run concurrently, each with its own buffer of
    /// `block_bytes` bytes.
    pub fn new(
        cache: Arc<ResidencyCache>,
        provider: Arc<dyn BlockProvider>,
        uploader: Arc<dyn BlockUploader>,
        workers: usize,
        block_bytes: usize,
    ) -> Self {
        let workers = workers.max(1);
        Self {
            cache,
            provider,
            uploader,
            pool: Arc::new(BufferPool::new(workers, block_bytes)),
            workers,
            stats: Arc::new(StreamStats::default()),
        }
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Decode and upload every ticket.
    ///
    /// On success returns the uploaded `(slot, block)` pairs; each is
    /// ReadLocked once on the caller's behalf and must be released when the
    /// frame is done with it.
    pub async fn stream(
        &self,
        tickets: Vec<WriteTicket>,
    ) -> Result<Vec<(EntrySlot, BlockIndex)>, StreamError> {
        if tickets.is_empty() {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let requested = tickets.len();
        let batch = Arc::new(Batch {
            work: Mutex::new(tickets.into()),
            done: Mutex::new(Vec::with_capacity(requested)),
            failure: Mutex::new(None),
            abort: AtomicBool::new(false),
        });

        let handles: Vec<_> = (0..self.workers.min(requested))
            .map(|worker| {
                let batch = batch.clone();
                let cache = self.cache.clone();
                let provider = self.provider.clone();
                let uploader = self.uploader.clone();
                let pool = self.pool.clone();
                let stats = self.stats.clone();
                tokio::task::spawn_blocking(move || {
                    run_worker(worker, &batch, &cache, &*provider, &*uploader, &pool, &stats)
                })
            })
            .collect();

        for joined in futures::future::join_all(handles).await {
            if let Err(e) = joined {
                error!(error = %e, "Decode worker panicked");
                batch.abort.store(true, Ordering::SeqCst);
                batch
                    .failure
                    .lock()
                    .get_or_insert(StreamError::WorkerPanicked(e.to_string()));
            }
        }

        let failure = batch.failure.lock().take();
        let done = std::mem::take(&mut *batch.done.lock());

        if let Some(err) = failure {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            self.unwind(&batch, &done);
            return Err(err);
        }

        info!(
            blocks = done.len(),
            workers = self.workers.min(requested),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Streamed blocks"
        );
        Ok(done)
    }

    /// Return the cache to a consistent state after a failed batch.
    fn unwind(&self, batch: &Batch, done: &[(EntrySlot, BlockIndex)]) {
        let pending: Vec<WriteTicket> = batch.work.lock().drain(..).collect();
        warn!(
            abandoned = pending.len(),
            released = done.len(),
            "Unwinding failed stream batch"
        );
        for ticket in pending {
            if let Err(e) = self.cache.abandon(ticket) {
                error!(error = %e, "Abandon during unwind failed");
            }
        }
        for (_, value) in done {
            if let Err(e) = self.cache.release(*value) {
                error!(error = %e, "Release during unwind failed");
            }
        }
    }
}

fn run_worker(
    worker: usize,
    batch: &Batch,
    cache: &ResidencyCache,
    provider: &dyn BlockProvider,
    uploader: &dyn BlockUploader,
    pool: &BufferPool,
    stats: &StreamStats,
) {
    let mut buffer = pool.acquire();

    while !batch.abort.load(Ordering::SeqCst) {
        let Some(ticket) = batch.work.lock().pop_front() else {
            break;
        };
        let (index, slot) = (ticket.value(), ticket.slot());

        // A panicking provider or uploader must not take the ticket down
        // with it; the slot would stay WriteLocked.
        let filled = panic::catch_unwind(AssertUnwindSafe(|| {
            provider
                .decode_block(&mut buffer, index)
                .map_err(|source| StreamError::Decode { index, source })?;
            uploader
                .upload(slot, &buffer)
                .map_err(|source| StreamError::Upload { index, source })
        }))
        .unwrap_or_else(|payload| Err(StreamError::WorkerPanicked(panic_message(&*payload))));

        let outcome = match filled {
            Ok(()) => cache.mark_uploaded(ticket).map_err(StreamError::from),
            Err(e) => {
                if let Err(abandon_err) = cache.abandon(ticket) {
                    error!(error = %abandon_err, "Abandon after failure failed");
                }
                Err(e)
            }
        };

        match outcome {
            Ok(()) => {
                debug!(worker, block = %index, %slot, "Block streamed");
                stats.blocks.fetch_add(1, Ordering::Relaxed);
                stats.bytes.fetch_add(buffer.len() as u64, Ordering::Relaxed);
                batch.done.lock().push((slot, index));
            }
            Err(e) => {
                error!(worker, block = %index, error = %e, "Block streaming failed");
                batch.abort.store(true, Ordering::SeqCst);
                batch.failure.lock().get_or_insert(e);
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
